use std::thread::JoinHandle;
use crossbeam_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::protocol::{StitchJob, WorkerRequest, WorkerResponse};
use crate::slice::{colorize, stitch_slice, ColoredSlice};

/// Start the slice worker thread
///
/// The worker announces itself with `Ready`, then serves jobs in arrival order
/// until it receives `Shutdown`, the request channel closes, or nobody listens
/// for responses anymore.
pub fn spawn_worker(
    requests: Receiver<WorkerRequest>,
    responses: UnboundedSender<WorkerResponse>,
) -> EngineResult<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("slice-worker".to_string())
        .spawn(move || run_worker(requests, responses))
        .map_err(|e| EngineError::pipeline(format!("failed to spawn slice worker: {}", e)))
}

fn run_worker(requests: Receiver<WorkerRequest>, responses: UnboundedSender<WorkerResponse>) {
    if responses.send(WorkerResponse::Ready).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        let job = match request {
            WorkerRequest::Stitch(job) => job,
            WorkerRequest::Shutdown => break,
        };

        let request_id = job.request_id;
        let response = match render(&job) {
            Ok(slice) => WorkerResponse::Slice { request_id, slice },
            Err(error) => WorkerResponse::Failed { request_id, error },
        };
        if responses.send(response).is_err() {
            break;
        }
    }

    log::debug!("Slice worker stopped");
}

fn render(job: &StitchJob) -> EngineResult<ColoredSlice> {
    let data = stitch_slice(&job.level, job.key.slice_type, job.key.index, &job.bricks)?;
    Ok(colorize(&data, &job.lut, job.value_range))
}
