// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;

/// Listens for the shutdown broadcast of its owner, the node for connection
/// handlers and the worker pool, a partition for its wake loop. The signal
/// latches: once seen, `recv` returns immediately.
#[derive(Debug)]
pub struct Shutdown {
    signalled: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn listen(notify: &broadcast::Sender<()>) -> Shutdown {
        Shutdown {
            signalled: false,
            notify: notify.subscribe(),
        }
    }

    /// Resolves on the shutdown signal, or when every sender is gone.
    pub async fn recv(&mut self) {
        if !self.signalled {
            let _ = self.notify.recv().await;
            self.signalled = true;
        }
    }
}
