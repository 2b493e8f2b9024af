//! Per-operation completion handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::{Error, Result};

/// Completion handle for a client operation.
///
/// Await it for the outcome, or poll it with [`Token::try_result`]. If the
/// session loop goes away before completing the operation the token
/// resolves to [`Error::SessionClosed`].
#[derive(Debug)]
#[must_use = "tokens report whether the operation succeeded"]
pub struct Token<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Sending half of a [`Token`], held by the session.
#[derive(Debug)]
pub(crate) struct Completer<T> {
    tx: oneshot::Sender<Result<T>>,
}

/// Create a connected completer/token pair.
pub(crate) fn pair<T>() -> (Completer<T>, Token<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Token { rx })
}

impl<T> Completer<T> {
    /// Resolve the token. A dropped token is not an error.
    pub fn complete(self, result: Result<T>) {
        let _ = self.tx.send(result);
    }
}

impl<T> Token<T> {
    /// A token that is already resolved.
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (done, token) = pair();
        done.complete(result);
        token
    }

    /// Take the result if the operation finished.
    ///
    /// Returns `None` while pending. The result is handed out once; polling
    /// again afterwards yields `SessionClosed`.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::SessionClosed)),
        }
    }
}

impl<T> Future for Token<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::SessionClosed)))
    }
}
