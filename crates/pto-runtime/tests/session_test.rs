//! Session lifecycle, resource accounting and failure paths.

mod common;

use anyhow::Result;
use common::{
    init_tracing, register_vector_functions, sim_session, vector_kernels, CountingDevice, VectorIo,
    SIZE,
};
use pto_core::{BuildMode, CoreType};
use pto_runtime::{
    api, status_of, DeviceSession, GraphBuilder, HalMemory, HostTensor, KernelTable, LaunchConfig,
    MemoryCapability, RuntimeArgs, RuntimeConfig, RuntimeError, SessionState, SimPlatform,
    STATUS_CAPABILITY_UNAVAILABLE, STATUS_EXECUTION_FAILED, STATUS_INVALID_STATE,
    STATUS_RESOURCE_EXHAUSTED,
};
use std::sync::Arc;

const LAUNCH: LaunchConfig = LaunchConfig {
    thread_count: 3,
    block_dim: 3,
    device_id: 0,
};

/// Two chained tasks on a kernel that always fails, plus one scratch buffer.
fn failing_orchestration(b: &GraphBuilder<'_>) -> pto_runtime::Result<()> {
    let out = b.arg_address(0)?;
    let scratch = b
        .device_malloc(256)
        .ok_or_else(|| RuntimeError::ResourceExhausted("scratch".to_string()))?;
    let t0 = b.add_task(&[out.into(), scratch.into()], 3, CoreType::Aiv)?;
    let t1 = b.add_task(&[out.into()], 0, CoreType::Aiv)?;
    b.add_successor(t0, t1)?;
    b.publish_task(t0)?;
    b.publish_task(t1)
}

#[test]
fn test_register_before_select_fails() {
    init_tracing();
    let mut session = sim_session(Arc::new(CountingDevice::default()), vector_kernels(), BuildMode::Overlapped);
    assert!(matches!(
        session.register_function(0, b"kernel_add"),
        Err(RuntimeError::DeviceNotSelected)
    ));
    assert_eq!(
        api::register_function(&mut session, 0, b"kernel_add"),
        STATUS_INVALID_STATE
    );
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn test_state_transitions_over_a_run() -> Result<()> {
    init_tracing();
    let mut session = sim_session(Arc::new(CountingDevice::default()), vector_kernels(), BuildMode::Overlapped);
    assert_eq!(session.state(), SessionState::Uninitialized);

    let io = VectorIo::new();
    // The first allocation selects the configured device.
    let mut run = session.initialize_runtime(io.args())?;
    assert_eq!(session.state(), SessionState::DeviceSelected);
    assert_eq!(session.device_id(), Some(0));

    register_vector_functions(&mut session)?;
    session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore")?;
    assert_eq!(session.state(), SessionState::Ready);

    session.finalize(&mut run)?;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(io.f.to_vec::<f32>()?, vec![20.0; SIZE]);

    session.close();
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert_eq!(session.function_address(0), None);
    Ok(())
}

#[test]
fn test_program_images_load_once_per_session() -> Result<()> {
    init_tracing();
    let device = Arc::new(CountingDevice::default());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Serialized);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    for _ in 0..2 {
        let io = VectorIo::new();
        let mut run = session.initialize_runtime(io.args())?;
        session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore")?;
        session.finalize(&mut run)?;
    }

    // One function block, two images, then per run: three tensors, the
    // descriptor image and three scratch buffers.
    assert_eq!(device.allocation_count(), 1 + 2 + 2 * 7);
    assert_eq!(device.live_allocations(), 3);

    session.close();
    assert!(device.leaked().is_empty());
    assert!(device.double_freed().is_empty());
    Ok(())
}

#[test]
fn test_kernel_failure_releases_run_memory() -> Result<()> {
    init_tracing();
    let device = Arc::new(CountingDevice::default());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    let out = HostTensor::zeroed(64);
    let mut run = session.initialize_runtime(RuntimeArgs::from_fn(failing_orchestration).output(out))?;
    let result = session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore");
    assert_eq!(status_of(&result), STATUS_EXECUTION_FAILED);
    match result {
        Err(RuntimeError::KernelFailed { task, message }) => {
            assert_eq!(task, 0);
            assert!(message.contains("refused"), "{message}");
        }
        other => panic!("expected a kernel failure, got {other:?}"),
    }

    // The successor of the failed task never ran.
    assert_eq!(run.graph().completed_count(), 0);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(device.live_allocations(), 3);

    // Finalizing a failed run is a no-op.
    let report = session.finalize(&mut run)?;
    assert_eq!(report.freed, 0);

    session.close();
    assert!(device.leaked().is_empty());
    assert!(device.double_freed().is_empty());
    Ok(())
}

#[test]
fn test_kernel_panic_fails_the_run() -> Result<()> {
    init_tracing();
    for mode in [BuildMode::Serialized, BuildMode::Overlapped] {
        for launch in [LaunchConfig::new(1, 1, 0), LAUNCH] {
            let device = Arc::new(CountingDevice::default());
            let mut session = sim_session(device.clone(), vector_kernels(), mode);
            session.select_device(0)?;
            register_vector_functions(&mut session)?;

            let args = RuntimeArgs::from_fn(|b: &GraphBuilder<'_>| {
                let out = b.arg_address(0)?;
                let t0 = b.add_task(&[out.into()], 4, CoreType::Aiv)?;
                b.publish_task(t0)
            })
            .output(HostTensor::zeroed(16));
            let mut run = session.initialize_runtime(args)?;

            let result = session.execute(&mut run, &launch, b"aicpu", b"aicore");
            match result {
                Err(RuntimeError::KernelFailed { task, message }) => {
                    assert_eq!(task, 0);
                    assert!(message.contains("kernel bug"), "{message}");
                }
                other => panic!("{mode:?} {launch:?}: expected a kernel failure, got {other:?}"),
            }
            assert_eq!(device.live_allocations(), 3);

            session.close();
            assert!(device.leaked().is_empty());
        }
    }
    Ok(())
}

#[test]
fn test_orchestration_panic_fails_the_run() -> Result<()> {
    init_tracing();
    let device = Arc::new(CountingDevice::default());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    let mut run = session.initialize_runtime(RuntimeArgs::from_fn(|b: &GraphBuilder<'_>| {
        b.device_malloc(64);
        panic!("builder bug")
    }))?;
    let result = session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore");
    assert_eq!(status_of(&result), STATUS_EXECUTION_FAILED);
    assert!(
        matches!(result, Err(RuntimeError::ExecutionError(ref msg)) if msg == "orchestration panicked: builder bug"),
        "{result:?}"
    );
    assert!(run.graph().is_sealed());
    assert_eq!(device.live_allocations(), 3);
    Ok(())
}

#[test]
fn test_failed_image_upload_releases_run_memory() -> Result<()> {
    init_tracing();
    // Allocation 1 is the function block, 2 to 4 the run's tensors, 5 and
    // 6 the control and compute images.
    for fail_at in [5, 6] {
        let device = Arc::new(CountingDevice::failing_at(fail_at));
        let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);
        session.select_device(0)?;
        register_vector_functions(&mut session)?;

        let io = VectorIo::new();
        let mut run = session.initialize_runtime(io.args())?;
        assert_eq!(device.live_allocations(), 4);

        let result = session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore");
        assert_eq!(status_of(&result), STATUS_RESOURCE_EXHAUSTED, "allocation {fail_at}");
        assert!(run.is_executed());
        assert_eq!(session.state(), SessionState::DeviceSelected);
        assert_eq!(device.live_allocations(), 1, "allocation {fail_at}");

        let report = session.finalize(&mut run)?;
        assert_eq!(report.freed, 0);

        session.close();
        assert!(device.leaked().is_empty());
        assert!(device.double_freed().is_empty());
    }
    Ok(())
}

#[test]
fn test_orchestration_error_aborts_run() -> Result<()> {
    init_tracing();
    let device = Arc::new(CountingDevice::default());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Serialized);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    let mut run = session.initialize_runtime(
        RuntimeArgs::from_fn(|b: &GraphBuilder<'_>| {
            let t0 = b.add_task(&[], 0, CoreType::Aiv)?;
            b.publish_task(t0)?;
            Err(RuntimeError::InvalidInput("bad shape".to_string()))
        })
        .input(HostTensor::from_vec(vec![1.0f32; SIZE])),
    )?;
    let result = session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore");
    assert!(matches!(result, Err(RuntimeError::InvalidInput(ref msg)) if msg == "bad shape"));
    assert_eq!(device.live_allocations(), 3);
    Ok(())
}

#[test]
fn test_descriptor_executes_once() -> Result<()> {
    init_tracing();
    let mut session = sim_session(Arc::new(CountingDevice::default()), vector_kernels(), BuildMode::Overlapped);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    let io = VectorIo::new();
    let mut run = session.initialize_runtime(io.args())?;
    session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore")?;
    assert!(run.is_executed());

    let again = session.execute(&mut run, &LAUNCH, b"aicpu", b"aicore");
    assert!(matches!(again, Err(RuntimeError::InvalidState(_))));
    assert_eq!(status_of(&again), STATUS_INVALID_STATE);

    session.finalize(&mut run)?;
    assert_eq!(io.f.to_vec::<f32>()?, vec![20.0; SIZE]);
    Ok(())
}

#[test]
fn test_execute_on_another_device_is_rejected() -> Result<()> {
    init_tracing();
    let device = Arc::new(CountingDevice::default());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    let io = VectorIo::new();
    let mut run = session.initialize_runtime(io.args())?;
    let other = LaunchConfig::new(3, 3, 1);
    assert!(matches!(
        session.execute(&mut run, &other, b"aicpu", b"aicore"),
        Err(RuntimeError::InvalidState(_))
    ));
    assert!(!run.is_executed());

    session.finalize(&mut run)?;
    // Only the function block remains; the images were never loaded.
    assert_eq!(device.live_allocations(), 1);
    Ok(())
}

#[test]
fn test_invalid_launch_shapes() -> Result<()> {
    init_tracing();
    let mut session = sim_session(Arc::new(CountingDevice::default()), vector_kernels(), BuildMode::Overlapped);
    let io = VectorIo::new();
    let mut run = session.initialize_runtime(io.args())?;

    for launch in [
        LaunchConfig::new(0, 3, 0),
        LaunchConfig::new(5, 3, 0),
        LaunchConfig::new(3, 0, 0),
        LaunchConfig::new(3, 25, 0),
    ] {
        assert!(
            matches!(
                session.execute(&mut run, &launch, b"aicpu", b"aicore"),
                Err(RuntimeError::InvalidInput(_))
            ),
            "{launch:?}"
        );
    }
    assert!(matches!(
        session.execute(&mut run, &LAUNCH, b"", b"aicore"),
        Err(RuntimeError::InvalidInput(_))
    ));
    session.finalize(&mut run)?;
    Ok(())
}

#[test]
fn test_unavailable_memory_capability() {
    init_tracing();
    let platform = SimPlatform::with_capability(
        MemoryCapability::Unavailable("driver missing".to_string()),
        KernelTable::new(),
    );
    let mut session = DeviceSession::new(Arc::new(platform), RuntimeConfig::default());

    // Selecting succeeds; the first call that needs memory reports the gap.
    assert_eq!(api::select_device(&mut session, 0), 0);
    assert_eq!(
        api::register_function(&mut session, 0, b"kernel_add"),
        STATUS_CAPABILITY_UNAVAILABLE
    );

    let mut storage = api::RuntimeStorage::with_capacity(api::runtime_size());
    let args = RuntimeArgs::from_fn(|_: &GraphBuilder<'_>| Ok(()))
        .input(HostTensor::from_vec(vec![0u8; 16]));
    assert_eq!(
        api::initialize(&mut session, &mut storage, args),
        STATUS_CAPABILITY_UNAVAILABLE
    );
    assert!(!storage.is_initialized());
}

#[test]
fn test_missing_hal_library_is_unavailable() {
    init_tracing();
    let capability = HalMemory::resolve_from("/nonexistent/libascend_hal.so");
    assert!(!capability.is_available());

    let platform = SimPlatform::with_capability(capability, KernelTable::new());
    let mut session = DeviceSession::new(Arc::new(platform), RuntimeConfig::default());
    session.select_device(0).ok();
    assert!(matches!(
        session.register_function(0, b"kernel_add"),
        Err(RuntimeError::CapabilityUnavailable(_))
    ));
}
