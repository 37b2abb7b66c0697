//! Client-side voice capture lifecycle.
//!
//! A [`Recorder`] owns at most one recording session at a time. The device
//! track acquired for a session is wrapped in a guard that stops it when the
//! session ends for any reason: stop, cancel, a capture error, or the
//! recorder being dropped.

use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("a stopped recording must be sent or discarded first")]
    PendingRecording,
    #[error("no recording in progress")]
    NotRecording,
    #[error("encoder failure: {0}")]
    Encoder(String),
}

/// A capture device that can hand out an exclusive track.
pub trait Microphone {
    type Track: Track;

    fn acquire(&mut self) -> Result<Self::Track, CaptureError>;
}

/// An active device track producing encoded audio.
pub trait Track {
    /// Drain the encoded audio produced since the last call.
    fn take_encoded(&mut self) -> Result<Vec<u8>, CaptureError>;

    /// Release the device. Called exactly once per acquired track.
    fn stop(&mut self);
}

struct TrackGuard<T: Track> {
    track: T,
}

impl<T: Track> Drop for TrackGuard<T> {
    fn drop(&mut self) {
        self.track.stop();
    }
}

/// Observable capture state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Stopped,
}

/// Encoded clip produced by a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub data: Vec<u8>,
    pub elapsed: Duration,
}

impl Recording {
    /// Whole seconds as sent in the upload's `duration` field.
    pub fn duration_seconds(&self) -> u32 {
        round_seconds(self.elapsed)
    }
}

/// Round a measured elapsed time to the nearest whole second.
pub fn round_seconds(elapsed: Duration) -> u32 {
    elapsed.as_secs_f64().round().min(u32::MAX as f64) as u32
}

enum Session<T: Track> {
    Idle,
    Recording {
        guard: TrackGuard<T>,
        started: Instant,
        buffer: Vec<u8>,
    },
    Stopped(Recording),
}

pub struct Recorder<M: Microphone> {
    microphone: M,
    session: Session<M::Track>,
}

impl<M: Microphone> Recorder<M> {
    pub fn new(microphone: M) -> Self {
        Self {
            microphone,
            session: Session::Idle,
        }
    }

    pub fn state(&self) -> CaptureState {
        match self.session {
            Session::Idle => CaptureState::Idle,
            Session::Recording { .. } => CaptureState::Recording,
            Session::Stopped(_) => CaptureState::Stopped,
        }
    }

    /// Idle -> Recording. Permission failures surface here, before any
    /// network activity.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.session {
            Session::Recording { .. } => return Err(CaptureError::AlreadyRecording),
            Session::Stopped(_) => return Err(CaptureError::PendingRecording),
            Session::Idle => {}
        }
        let track = self.microphone.acquire()?;
        self.session = Session::Recording {
            guard: TrackGuard { track },
            started: Instant::now(),
            buffer: Vec::new(),
        };
        Ok(())
    }

    /// Pull encoded audio from the track into the session buffer. An encoder
    /// error releases the device and returns to Idle.
    pub fn poll(&mut self) -> Result<usize, CaptureError> {
        let Session::Recording { guard, buffer, .. } = &mut self.session else {
            return Err(CaptureError::NotRecording);
        };
        match guard.track.take_encoded() {
            Ok(chunk) => {
                buffer.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            Err(e) => {
                self.session = Session::Idle;
                Err(e)
            }
        }
    }

    /// Recording -> Stopped. The device is released before the clip is
    /// returned.
    pub fn stop(&mut self) -> Result<&Recording, CaptureError> {
        self.poll()?;
        let Session::Recording {
            guard,
            started,
            buffer,
        } = std::mem::replace(&mut self.session, Session::Idle)
        else {
            return Err(CaptureError::NotRecording);
        };
        drop(guard);
        self.session = Session::Stopped(Recording {
            data: buffer,
            elapsed: started.elapsed(),
        });
        match &self.session {
            Session::Stopped(rec) => Ok(rec),
            _ => Err(CaptureError::NotRecording),
        }
    }

    /// Recording -> Idle, discarding buffered audio.
    pub fn cancel(&mut self) -> Result<(), CaptureError> {
        if !matches!(self.session, Session::Recording { .. }) {
            return Err(CaptureError::NotRecording);
        }
        self.session = Session::Idle;
        Ok(())
    }

    /// Stopped -> Idle, handing the clip to the sender.
    pub fn take(&mut self) -> Option<Recording> {
        match std::mem::replace(&mut self.session, Session::Idle) {
            Session::Stopped(rec) => Some(rec),
            other => {
                self.session = other;
                None
            }
        }
    }

    /// Stopped -> Idle without sending.
    pub fn discard(&mut self) {
        if matches!(self.session, Session::Stopped(_)) {
            self.session = Session::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct Counters {
        acquired: Rc<Cell<u32>>,
        stopped: Rc<Cell<u32>>,
    }

    struct FakeMic {
        counters: Counters,
        deny: bool,
        fail_encoder: bool,
    }

    struct FakeTrack {
        counters: Counters,
        fail: bool,
    }

    impl Microphone for FakeMic {
        type Track = FakeTrack;

        fn acquire(&mut self) -> Result<FakeTrack, CaptureError> {
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            self.counters.acquired.set(self.counters.acquired.get() + 1);
            Ok(FakeTrack {
                counters: self.counters.clone(),
                fail: self.fail_encoder,
            })
        }
    }

    impl Track for FakeTrack {
        fn take_encoded(&mut self) -> Result<Vec<u8>, CaptureError> {
            if self.fail {
                return Err(CaptureError::Encoder("boom".into()));
            }
            Ok(vec![1, 2, 3])
        }

        fn stop(&mut self) {
            self.counters.stopped.set(self.counters.stopped.get() + 1);
        }
    }

    fn recorder(deny: bool, fail_encoder: bool) -> (Recorder<FakeMic>, Counters) {
        let counters = Counters::default();
        let mic = FakeMic {
            counters: counters.clone(),
            deny,
            fail_encoder,
        };
        (Recorder::new(mic), counters)
    }

    #[test]
    fn stop_releases_track_and_yields_clip() {
        let (mut rec, c) = recorder(false, false);
        rec.start().unwrap();
        assert_eq!(rec.state(), CaptureState::Recording);
        assert_eq!(rec.start(), Err(CaptureError::AlreadyRecording));
        rec.poll().unwrap();
        let clip = rec.stop().unwrap();
        assert_eq!(clip.data, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(c.stopped.get(), 1);
        assert_eq!(rec.state(), CaptureState::Stopped);
        assert_eq!(rec.start(), Err(CaptureError::PendingRecording));
        assert!(rec.take().is_some());
        assert_eq!(rec.state(), CaptureState::Idle);
    }

    #[test]
    fn cancel_releases_and_discards() {
        let (mut rec, c) = recorder(false, false);
        rec.start().unwrap();
        rec.cancel().unwrap();
        assert_eq!(c.stopped.get(), 1);
        assert_eq!(rec.state(), CaptureState::Idle);
        assert!(rec.take().is_none());
        assert_eq!(rec.cancel(), Err(CaptureError::NotRecording));
    }

    #[test]
    fn permission_denied_stays_idle() {
        let (mut rec, c) = recorder(true, false);
        assert_eq!(rec.start(), Err(CaptureError::PermissionDenied));
        assert_eq!(rec.state(), CaptureState::Idle);
        assert_eq!(c.acquired.get(), 0);
    }

    #[test]
    fn encoder_error_releases_track() {
        let (mut rec, c) = recorder(false, true);
        rec.start().unwrap();
        assert!(matches!(rec.poll(), Err(CaptureError::Encoder(_))));
        assert_eq!(c.stopped.get(), 1);
        assert_eq!(rec.state(), CaptureState::Idle);
    }

    #[test]
    fn teardown_releases_track() {
        let (mut rec, c) = recorder(false, false);
        rec.start().unwrap();
        drop(rec);
        assert_eq!(c.acquired.get(), 1);
        assert_eq!(c.stopped.get(), 1);
    }

    #[test]
    fn rounding_to_whole_seconds() {
        assert_eq!(round_seconds(Duration::from_millis(4_600)), 5);
        assert_eq!(round_seconds(Duration::from_millis(4_400)), 4);
        assert_eq!(round_seconds(Duration::ZERO), 0);
    }
}
