//! Passphrase request/response channel for encrypted archives.
//!
//! When an archive turns out to be encrypted the resolve task sends a
//! [`PassphraseRequest`] and waits. The consumer answers with
//! [`PassphraseRequest::submit`] (and can await the verdict) or
//! [`PassphraseRequest::abandon`]. Dropping the request counts as abandoning.

use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

/// Verdict on one submitted passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassphraseOutcome {
    /// The archive is unlocked; resolution continues.
    Accepted,
    /// The archive rejected the passphrase.
    Invalid,
    /// Blank input; the archive was not consulted.
    Empty,
}

pub(crate) enum Submission {
    Passphrase {
        text: String,
        verdict: oneshot::Sender<PassphraseOutcome>,
    },
    Abandon,
}

/// A request for the passphrase of an encrypted archive.
#[derive(Debug)]
pub struct PassphraseRequest {
    path: PathBuf,
    attempt: u32,
    previous: Option<PassphraseOutcome>,
    reply: oneshot::Sender<Submission>,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passphrase { .. } => f.write_str("Passphrase(..)"),
            Self::Abandon => f.write_str("Abandon"),
        }
    }
}

impl PassphraseRequest {
    pub(crate) fn new(
        path: PathBuf,
        attempt: u32,
        previous: Option<PassphraseOutcome>,
    ) -> (Self, oneshot::Receiver<Submission>) {
        let (reply, receiver) = oneshot::channel();
        (
            Self {
                path,
                attempt,
                previous,
                reply,
            },
            receiver,
        )
    }

    /// Archive being unlocked.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Verdict on the previous attempt, `None` on the first one.
    #[must_use]
    pub fn previous(&self) -> Option<PassphraseOutcome> {
        self.previous
    }

    /// Answers with `passphrase`. Await the returned handle for the verdict.
    pub fn submit(self, passphrase: impl Into<String>) -> PendingVerdict {
        let (verdict, receiver) = oneshot::channel();
        // A closed reply channel means the loader stopped; the verdict then resolves to None.
        let _ = self.reply.send(Submission::Passphrase {
            text: passphrase.into(),
            verdict,
        });
        PendingVerdict { receiver }
    }

    /// Gives up. The loader transitions to `Failed`.
    pub fn abandon(self) {
        let _ = self.reply.send(Submission::Abandon);
    }
}

/// Verdict on a submitted passphrase, once the loader has checked it.
#[derive(Debug)]
pub struct PendingVerdict {
    receiver: oneshot::Receiver<PassphraseOutcome>,
}

impl PendingVerdict {
    /// Waits for the verdict. `None` if the loader stopped first.
    pub async fn outcome(self) -> Option<PassphraseOutcome> {
        self.receiver.await.ok()
    }
}

/// Returns true when `passphrase` is blank and must not reach the archive.
#[must_use]
pub fn is_blank(passphrase: &str) -> bool {
    passphrase.trim().is_empty()
}
