//! End-to-end runs of the four-task vector example on the simulated device.
//!
//! With a = 1 and b = 2 every element of f is (3 + 1) * (3 + 2) = 20.

mod common;

use anyhow::Result;
use common::{init_tracing, register_vector_functions, sim_session, vector_kernels, VectorIo, SIZE};
use pto_core::BuildMode;
use pto_runtime::{api, LaunchConfig, SessionState, SimDevice};
use std::sync::Arc;

fn run_vector_example(mode: BuildMode, launch: LaunchConfig) -> Result<Vec<f32>> {
    let device = Arc::new(SimDevice::new());
    let mut session = sim_session(device.clone(), vector_kernels(), mode);
    session.select_device(launch.device_id)?;
    register_vector_functions(&mut session)?;

    let io = VectorIo::new();
    let mut run = session.initialize_runtime(io.args())?;
    assert_eq!(run.build_mode(), mode);
    session.execute(&mut run, &launch, b"aicpu", b"aicore")?;
    assert_eq!(run.graph().len(), 4);
    assert_eq!(run.graph().completed_count(), 4);

    let report = session.finalize(&mut run)?;
    assert_eq!(report.copied_back, 1);
    // a, b, f, the descriptor image and three scratch buffers
    assert_eq!(report.freed, 7);

    // Function block and both program images stay with the session.
    assert_eq!(device.live_allocations(), 3);
    session.close();
    assert_eq!(device.live_allocations(), 0);

    Ok(io.f.to_vec::<f32>()?)
}

#[test]
fn test_vector_example_overlapped() -> Result<()> {
    init_tracing();
    let f = run_vector_example(BuildMode::Overlapped, LaunchConfig::new(3, 3, 0))?;
    assert_eq!(f, vec![20.0; SIZE]);
    Ok(())
}

#[test]
fn test_vector_example_serialized() -> Result<()> {
    init_tracing();
    let f = run_vector_example(BuildMode::Serialized, LaunchConfig::new(3, 3, 0))?;
    assert_eq!(f, vec![20.0; SIZE]);
    Ok(())
}

#[test]
fn test_results_independent_of_mode_and_launch_shape() -> Result<()> {
    init_tracing();
    let reference = run_vector_example(BuildMode::Serialized, LaunchConfig::new(1, 1, 0))?;
    for mode in [BuildMode::Serialized, BuildMode::Overlapped] {
        for (threads, blocks) in [(1, 1), (2, 1), (2, 4), (4, 6), (4, 24)] {
            let f = run_vector_example(mode, LaunchConfig::new(threads, blocks, 0))?;
            assert_eq!(f, reference, "{mode:?} with {threads} threads, {blocks} blocks");
        }
    }
    Ok(())
}

#[test]
fn test_vector_example_repeated_runs_in_one_session() -> Result<()> {
    init_tracing();
    let device = Arc::new(SimDevice::new());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);
    session.select_device(0)?;
    register_vector_functions(&mut session)?;

    for _ in 0..3 {
        let io = VectorIo::new();
        let mut run = session.initialize_runtime(io.args())?;
        session.execute(&mut run, &LaunchConfig::new(3, 3, 0), b"aicpu", b"aicore")?;
        session.finalize(&mut run)?;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(io.f.to_vec::<f32>()?, vec![20.0; SIZE]);
        assert_eq!(device.live_allocations(), 3);
    }
    Ok(())
}

#[test]
fn test_vector_example_through_status_calls() -> Result<()> {
    init_tracing();
    let device = Arc::new(SimDevice::new());
    let mut session = sim_session(device.clone(), vector_kernels(), BuildMode::Overlapped);

    assert_eq!(api::select_device(&mut session, 0), 0);
    assert_eq!(api::register_function(&mut session, 0, b"kernel_add"), 0);
    assert_eq!(api::register_function(&mut session, 1, b"kernel_add_scalar"), 0);
    assert_eq!(api::register_function(&mut session, 2, b"kernel_mul"), 0);

    let io = VectorIo::new();
    let mut storage = api::RuntimeStorage::with_capacity(api::runtime_size());
    assert_eq!(api::initialize(&mut session, &mut storage, io.args()), 0);
    assert_eq!(
        api::execute(&mut session, &mut storage, 3, 3, 0, b"aicpu", b"aicore"),
        0
    );
    assert_eq!(api::finalize(&mut session, &mut storage), 0);
    assert!(!storage.is_initialized());
    assert_eq!(io.f.to_vec::<f32>()?, vec![20.0; SIZE]);

    // Three single-function blocks plus two program images.
    assert_eq!(device.live_allocations(), 5);
    Ok(())
}
