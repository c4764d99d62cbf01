//! Worker loop run inside each spawned worker process

use crate::error::ProcessorError;
use crate::logsheet::LogSheet;
use crate::package::WorkPackage;
use crate::process::WorkerContext;
use crate::processor::WorkPackageProcessor;
use crate::protocol::{decode_count, TaskCommand, TaskStatus};
use crate::signals::ExitFlags;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Processes packages handed over by the Receiver until told to stop
///
/// Every pass reports a status first. After reporting anything but `OK`
/// the loop ends, so a failure is always reported exactly once.
pub struct PackageWorker {
    processor: Box<dyn WorkPackageProcessor>,
    flags: ExitFlags,
    log: Arc<LogSheet>,
    packages: u64,
}

impl PackageWorker {
    pub fn new(
        processor: Box<dyn WorkPackageProcessor>,
        flags: ExitFlags,
        log: Arc<LogSheet>,
    ) -> Self {
        Self {
            processor,
            flags,
            log,
            packages: 0,
        }
    }

    pub fn packages(&self) -> u64 {
        self.packages
    }

    /// Run until stopped; returns the last status reported
    pub fn run<R: Read + AsFd, W: Write>(&mut self, ctx: &mut WorkerContext<R, W>) -> TaskStatus {
        let mut status = TaskStatus::Ok;

        while !ctx.stop_requested() {
            if status == TaskStatus::Ok && self.flags.any() {
                status = TaskStatus::Exit;
            }
            if let Err(e) = ctx.send_message(&status.to_message()) {
                warn!(error = %e, "Cannot report status to receiver");
                break;
            }
            if status != TaskStatus::Ok {
                break;
            }

            if !ctx.wait_for_message(None) {
                break;
            }
            match self.receive_package(ctx) {
                Ok(Some(package)) => status = self.process(&package),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Bad message from receiver");
                    status = TaskStatus::Failed;
                }
            }
        }

        if let Err(e) = self.processor.perform_shutdown() {
            warn!(error = %e, "Processor shutdown failed");
        }
        info!(pid = std::process::id(), packages = self.packages, %status, "Worker done");
        status
    }

    /// Command, then element count, then payload; `None` for anything but `Continue`
    fn receive_package<R: Read + AsFd, W: Write>(
        &mut self,
        ctx: &mut WorkerContext<R, W>,
    ) -> crate::error::Result<Option<WorkPackage>> {
        let command = TaskCommand::from_message(&ctx.receive_message()?)?;
        if command != TaskCommand::Continue {
            debug!(%command, "No package this round");
            return Ok(None);
        }
        let count = decode_count(&ctx.receive_message()?)?;
        let data = ctx.receive_message()?;
        Ok(Some(WorkPackage::from_parts(data, count)))
    }

    fn process(&mut self, package: &WorkPackage) -> TaskStatus {
        match self.processor.process_work_package(package) {
            Ok(()) => {
                self.packages += 1;
                TaskStatus::Ok
            }
            Err(ProcessorError::TerminateJob(reason)) => {
                warn!(%reason, "Processor requested job termination");
                self.log
                    .write_debug(&format!("Job termination requested: {}", reason));
                TaskStatus::RequestJobTermination
            }
            Err(e) => {
                warn!(error = %e, "Work package failed");
                self.log
                    .write_debug(&format!("Work package failed: {}", e));
                TaskStatus::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pipe::{read_message, write_message};
    use crate::protocol::encode_count;
    use parking_lot::Mutex;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Records package sizes and fails on the given package number
    struct ScriptedProcessor {
        seen: Arc<Mutex<Vec<u64>>>,
        fail_on: Option<(usize, ProcessorError)>,
    }

    impl WorkPackageProcessor for ScriptedProcessor {
        fn perform_initialization(&mut self, _log: &Arc<LogSheet>) -> Result<(), ProcessorError> {
            Ok(())
        }

        fn new_processor(
            &self,
            _log: Arc<LogSheet>,
        ) -> Result<Box<dyn WorkPackageProcessor>, ProcessorError> {
            unreachable!()
        }

        fn process_work_package(&mut self, package: &WorkPackage) -> Result<(), ProcessorError> {
            let mut seen = self.seen.lock();
            seen.push(package.num_elements());
            if self.fail_on.as_ref().is_some_and(|(n, _)| seen.len() == *n) {
                if let Some((_, e)) = self.fail_on.take() {
                    return Err(e);
                }
            }
            Ok(())
        }

        fn perform_shutdown(&mut self) -> Result<(), ProcessorError> {
            Ok(())
        }
    }

    fn spawn_worker(
        fail_on: Option<(usize, ProcessorError)>,
        flags: ExitFlags,
    ) -> (
        thread::JoinHandle<TaskStatus>,
        UnixStream,
        Arc<AtomicBool>,
        Arc<Mutex<Vec<u64>>>,
    ) {
        let (parent, child) = UnixStream::pair().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let processor = ScriptedProcessor {
            seen: Arc::clone(&seen),
            fail_on,
        };
        let child_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let output = child.try_clone().unwrap();
            let mut ctx = WorkerContext::new(child, output, child_stop);
            PackageWorker::new(Box::new(processor), flags, Arc::new(LogSheet::disabled()))
                .run(&mut ctx)
        });
        (handle, parent, stop, seen)
    }

    fn status(parent: &mut UnixStream) -> TaskStatus {
        TaskStatus::from_message(&read_message(parent).unwrap()).unwrap()
    }

    fn send_package(parent: &mut UnixStream, records: u64) {
        let mut package = WorkPackage::new();
        for i in 0..records {
            package.push_record(&format!("k{}", i), b"v");
        }
        write_message(parent, &TaskCommand::Continue.to_message()).unwrap();
        write_message(parent, &encode_count(package.num_elements())).unwrap();
        write_message(parent, package.data()).unwrap();
    }

    #[test]
    fn test_processes_packages_until_stopped() {
        let (handle, mut parent, stop, seen) = spawn_worker(None, ExitFlags::new());

        assert_eq!(status(&mut parent), TaskStatus::Ok);
        send_package(&mut parent, 3);
        assert_eq!(status(&mut parent), TaskStatus::Ok);
        write_message(&mut parent, &TaskCommand::Ignore.to_message()).unwrap();
        assert_eq!(status(&mut parent), TaskStatus::Ok);
        send_package(&mut parent, 1);
        assert_eq!(status(&mut parent), TaskStatus::Ok);

        stop.store(true, Ordering::SeqCst);
        assert_eq!(handle.join().unwrap(), TaskStatus::Ok);
        assert_eq!(*seen.lock(), vec![3, 1]);
    }

    #[test]
    fn test_terminate_job_is_reported_once() {
        let fail = ProcessorError::TerminateJob("disk full".into());
        let (handle, mut parent, _, seen) = spawn_worker(Some((2, fail)), ExitFlags::new());

        assert_eq!(status(&mut parent), TaskStatus::Ok);
        send_package(&mut parent, 2);
        assert_eq!(status(&mut parent), TaskStatus::Ok);
        send_package(&mut parent, 2);
        assert_eq!(status(&mut parent), TaskStatus::RequestJobTermination);

        assert_eq!(handle.join().unwrap(), TaskStatus::RequestJobTermination);
        assert_eq!(seen.lock().len(), 2);
        assert!(read_message(&mut parent).is_err());
    }

    #[test]
    fn test_abort_reports_failed() {
        let fail = ProcessorError::Abort("bad input".into());
        let (handle, mut parent, _, _) = spawn_worker(Some((1, fail)), ExitFlags::new());

        assert_eq!(status(&mut parent), TaskStatus::Ok);
        send_package(&mut parent, 1);
        assert_eq!(status(&mut parent), TaskStatus::Failed);
        assert_eq!(handle.join().unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_exit_flag_reports_exit() {
        let flags = ExitFlags::new();
        let (handle, mut parent, _, seen) = spawn_worker(None, flags.clone());

        assert_eq!(status(&mut parent), TaskStatus::Ok);
        flags.raise_exit();
        send_package(&mut parent, 4);

        // The package in flight is still finished
        assert_eq!(status(&mut parent), TaskStatus::Exit);
        assert_eq!(handle.join().unwrap(), TaskStatus::Exit);
        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn test_closed_channel_ends_worker() {
        let (handle, mut parent, _, _) = spawn_worker(None, ExitFlags::new());
        assert_eq!(status(&mut parent), TaskStatus::Ok);
        drop(parent);
        assert_eq!(handle.join().unwrap(), TaskStatus::Failed);
    }
}
