//! Audio session setup that runs once a call connects.
//!
//! The platform audio session is an external collaborator behind [`AudioOutput`]. The
//! configuration sequence runs on its own thread so a slow platform call never holds up the
//! negotiation driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Sender, unbounded};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::session::SessionEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioConfigurationError {
    #[error("could not lock audio configuration: {0}")]
    Lock(String),
    #[error("could not select play-and-record category: {0}")]
    Category(String),
    #[error("could not route output to the loudspeaker: {0}")]
    Route(String),
    #[error("could not activate audio session: {0}")]
    Activate(String),
}

/// Platform audio session hooks, invoked in the order listed.
pub trait AudioOutput: Send + 'static {
    fn lock_configuration(&mut self) -> Result<(), AudioConfigurationError>;
    fn set_play_and_record(&mut self) -> Result<(), AudioConfigurationError>;
    fn route_to_speaker(&mut self) -> Result<(), AudioConfigurationError>;
    fn activate(&mut self) -> Result<(), AudioConfigurationError>;
    fn unlock_configuration(&mut self);
}

/// Used where the host has no audio session to configure.
#[derive(Debug, Default)]
pub struct NullAudioOutput;

impl AudioOutput for NullAudioOutput {
    fn lock_configuration(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn set_play_and_record(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn route_to_speaker(&mut self) -> Result<(), AudioConfigurationError> {
        tracing::debug!("no audio output; loudspeaker route is a no-op");
        Ok(())
    }

    fn activate(&mut self) -> Result<(), AudioConfigurationError> {
        Ok(())
    }

    fn unlock_configuration(&mut self) {}
}

/// Lock, configure, unlock. The lock is released even when a later step fails.
pub fn configure(output: &mut dyn AudioOutput) -> Result<(), AudioConfigurationError> {
    output.lock_configuration()?;
    let result = output
        .set_play_and_record()
        .and_then(|()| output.route_to_speaker())
        .and_then(|()| output.activate());
    output.unlock_configuration();
    result
}

enum AudioJob {
    Configure,
}

/// Serial worker owning the audio output.
pub struct AudioWorker {
    jobs: Option<Sender<AudioJob>>,
    thread: Option<thread::JoinHandle<()>>,
    loudspeaker: Arc<AtomicBool>,
}

impl AudioWorker {
    pub fn spawn(
        mut output: Box<dyn AudioOutput>,
        loudspeaker: Arc<AtomicBool>,
        events: broadcast::Sender<SessionEvent>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<AudioJob>();
        let flag = Arc::clone(&loudspeaker);
        let thread = thread::Builder::new()
            .name("facelink-audio".into())
            .spawn(move || {
                for job in rx {
                    match job {
                        AudioJob::Configure => match configure(output.as_mut()) {
                            Ok(()) => {
                                flag.store(true, Ordering::SeqCst);
                                tracing::info!("audio routed to loudspeaker");
                                let _ = events.send(SessionEvent::LoudspeakerEnabled);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "audio configuration failed");
                                let _ = events.send(SessionEvent::AudioFailed(err));
                            }
                        },
                    }
                }
                tracing::trace!("audio worker exiting");
            })?;
        Ok(Self {
            jobs: Some(tx),
            thread: Some(thread),
            loudspeaker,
        })
    }

    pub fn request_configuration(&self) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(AudioJob::Configure).is_err() {
                tracing::warn!("audio worker is gone; configuration skipped");
            }
        }
    }

    pub fn loudspeaker_enabled(&self) -> bool {
        self.loudspeaker.load(Ordering::SeqCst)
    }
}

impl Drop for AudioWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_route: bool,
    }

    impl AudioOutput for Recording {
        fn lock_configuration(&mut self) -> Result<(), AudioConfigurationError> {
            self.calls.lock().push("lock");
            Ok(())
        }

        fn set_play_and_record(&mut self) -> Result<(), AudioConfigurationError> {
            self.calls.lock().push("category");
            Ok(())
        }

        fn route_to_speaker(&mut self) -> Result<(), AudioConfigurationError> {
            self.calls.lock().push("route");
            if self.fail_route {
                Err(AudioConfigurationError::Route("no speaker".into()))
            } else {
                Ok(())
            }
        }

        fn activate(&mut self) -> Result<(), AudioConfigurationError> {
            self.calls.lock().push("activate");
            Ok(())
        }

        fn unlock_configuration(&mut self) {
            self.calls.lock().push("unlock");
        }
    }

    #[test]
    fn configuration_runs_in_order() {
        let mut output = Recording::default();
        configure(&mut output).expect("configure");
        assert_eq!(
            *output.calls.lock(),
            vec!["lock", "category", "route", "activate", "unlock"]
        );
    }

    #[test]
    fn failed_step_still_unlocks() {
        let mut output = Recording {
            fail_route: true,
            ..Default::default()
        };
        let err = configure(&mut output).expect_err("route fails");
        assert_eq!(err, AudioConfigurationError::Route("no speaker".into()));
        assert_eq!(*output.calls.lock(), vec!["lock", "category", "route", "unlock"]);
    }

    #[test]
    fn worker_sets_flag_only_on_success() {
        let (events, mut rx) = broadcast::channel(8);
        let flag = Arc::new(AtomicBool::new(false));
        let worker = AudioWorker::spawn(
            Box::new(Recording {
                fail_route: true,
                ..Default::default()
            }),
            Arc::clone(&flag),
            events.clone(),
        )
        .expect("spawn");
        worker.request_configuration();
        drop(worker);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::AudioFailed(_))));

        let flag = Arc::new(AtomicBool::new(false));
        let output = Recording::default();
        let calls = Arc::clone(&output.calls);
        let worker = AudioWorker::spawn(Box::new(output), Arc::clone(&flag), events).expect("spawn");
        worker.request_configuration();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !worker.loudspeaker_enabled() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.loudspeaker_enabled());
        assert_eq!(calls.lock().len(), 5);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::LoudspeakerEnabled)));
    }
}
