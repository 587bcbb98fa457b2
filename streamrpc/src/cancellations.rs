// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Tells a connection that one of its calls ended early: the client dispatch sends the server a
/// cancel message, and the server writes a close for a call whose handler was dropped.
#[derive(Debug, Clone)]
pub struct CallCancellation(mpsc::UnboundedSender<u64>);

/// The IDs of calls that ended early, in the order they ended.
#[derive(Debug)]
pub struct CanceledCalls(mpsc::UnboundedReceiver<u64>);

/// Returns a connected [`CallCancellation`] and [`CanceledCalls`].
pub fn cancellations() -> (CallCancellation, CanceledCalls) {
    // Unbounded, since cancellations are sent from drop fns, which cannot wait. The number of
    // calls in flight still bounds it.
    let (tx, rx) = mpsc::unbounded_channel();
    (CallCancellation(tx), CanceledCalls(rx))
}

impl CallCancellation {
    /// Reports that the call with ID `call_id` ended early. Reporting a call the connection no
    /// longer tracks is a no-op.
    pub fn cancel(&self, call_id: u64) {
        let _ = self.0.send(call_id);
    }
}

impl CanceledCalls {
    /// Polls for the next call that ended early.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        self.0.poll_recv(cx)
    }

    #[cfg(test)]
    pub async fn recv(&mut self) -> Option<u64> {
        self.0.recv().await
    }
}
