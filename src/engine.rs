//! Transfer execution.
//!
//! All copies are issued from one thread, iterations outer and transfers
//! inner, so every stream receives its copies interleaved with the others and
//! the transfers overlap on the hardware. Issuing never blocks. The first copy
//! of a transfer is preceded by its start event and the last one is followed
//! by its stop event. The only blocking point is [`drain`].

use crate::backend::DeviceRuntime;
use crate::error::{HitsError, Locate, Result};
use crate::logging::{self, LogLevel};
use crate::progress::ProgressSink;
use crate::transfer::{TransferDescriptor, TransferState};

/// Issue `iterations` copies on every descriptor.
///
/// # Errors
///
/// [`HitsError::InvalidConfig`] for zero iterations; otherwise the first
/// runtime failure.
pub fn issue(
    runtime: &dyn DeviceRuntime,
    descriptors: &mut [TransferDescriptor],
    iterations: u64,
    sink: &dyn ProgressSink,
) -> Result<()> {
    if iterations == 0 {
        return Err(HitsError::config("iterations", "must be greater than 0"));
    }

    for iteration in 0..iterations {
        let is_last = iteration == iterations - 1;
        for transfer in descriptors.iter_mut() {
            issue_one(runtime, transfer, is_last, sink)?;
        }
    }
    Ok(())
}

fn issue_one(
    runtime: &dyn DeviceRuntime,
    transfer: &mut TransferDescriptor,
    is_last: bool,
    sink: &dyn ProgressSink,
) -> Result<()> {
    let device = transfer.device;
    let copy = transfer.copy_request()?;

    if transfer.state == TransferState::NotStarted {
        sink.transfer_started(&transfer.announcement());
        runtime
            .record_event(device, transfer.start, transfer.stream)
            .located()?;
        transfer.state = TransferState::Running;
        logging::log_transfer(
            LogLevel::Trace,
            "engine",
            transfer.index,
            Some(device),
            "start event recorded",
        );
    }

    runtime
        .copy_async(device, transfer.stream, copy)
        .located()?;

    if is_last {
        runtime
            .record_event(device, transfer.stop, transfer.stream)
            .located()?;
        transfer.state = TransferState::Completed;
        logging::log_transfer(
            LogLevel::Trace,
            "engine",
            transfer.index,
            Some(device),
            "stop event recorded",
        );
    }
    Ok(())
}

/// Wait for every descriptor's device, one after the other in descriptor
/// order.
pub fn drain(runtime: &dyn DeviceRuntime, descriptors: &[TransferDescriptor]) -> Result<()> {
    for transfer in descriptors {
        runtime.synchronize(transfer.device).located()?;
    }
    Ok(())
}

/// [`issue`] followed by [`drain`].
pub fn execute(
    runtime: &dyn DeviceRuntime,
    descriptors: &mut [TransferDescriptor],
    iterations: u64,
    sink: &dyn ProgressSink,
) -> Result<()> {
    issue(runtime, descriptors, iterations, sink)?;
    drain(runtime, descriptors)
}
