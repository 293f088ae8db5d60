//! Platform architecture parameters and runtime limits.
//!
//! Everything derives from the block dimension: one block is one AIC (cube)
//! core plus two AIV (vector) cores.

/// Maximum block dimension supported by the platform.
pub const PLATFORM_MAX_BLOCKDIM: usize = 24;

/// Cores per block.
pub const PLATFORM_CORES_PER_BLOCKDIM: usize = 3;
pub const PLATFORM_AIC_CORES_PER_BLOCKDIM: usize = 1;
pub const PLATFORM_AIV_CORES_PER_BLOCKDIM: usize = 2;

/// Maximum number of control-core (AICPU) scheduling threads.
pub const PLATFORM_MAX_AICPU_THREADS: usize = 4;

/// Per-thread core budget. A single scheduling thread must be able to own
/// every core of a full-size launch.
pub const PLATFORM_MAX_AIC_PER_THREAD: usize =
    PLATFORM_MAX_BLOCKDIM * PLATFORM_AIC_CORES_PER_BLOCKDIM;
pub const PLATFORM_MAX_AIV_PER_THREAD: usize =
    PLATFORM_MAX_BLOCKDIM * PLATFORM_AIV_CORES_PER_BLOCKDIM;
pub const PLATFORM_MAX_CORES_PER_THREAD: usize =
    PLATFORM_MAX_AIC_PER_THREAD + PLATFORM_MAX_AIV_PER_THREAD;

/// Default task-graph capacity.
pub const RUNTIME_MAX_TASKS: usize = 1024;

/// Maximum number of arguments a single task can carry.
pub const RUNTIME_MAX_ARGS: usize = 16;

/// Function identifiers are `0..RUNTIME_MAX_FUNC_ID`.
pub const RUNTIME_MAX_FUNC_ID: usize = 64;

/// Maximum number of orchestration arguments.
pub const RUNTIME_MAX_ORCH_ARGS: usize = 64;

/// Per-run tracker limits.
pub const RUNTIME_MAX_DEVICE_ALLOCS: usize = 256;
pub const RUNTIME_MAX_TENSOR_PAIRS: usize = 64;
