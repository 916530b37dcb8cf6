// Copyright 2024, The Android Open Source Project
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

//! One-shot alarm posting a message to the main loop on expiry.

use crate::Message;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time;

pub struct Alarm {
    tx: UnboundedSender<Message>,
    task: Option<JoinHandle<()>>,
}

impl Alarm {
    pub fn new(tx: UnboundedSender<Message>) -> Self {
        Self { tx, task: None }
    }

    /// Arm the alarm; a pending schedule is replaced.
    pub fn schedule(&mut self, delay: Duration, message: Message) {
        self.cancel();
        let tx = self.tx.clone();
        self.task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(message);
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GROUP_ID_UNKNOWN;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new(tx);

        alarm.schedule(Duration::from_millis(100), Message::SuspendTimeout(GROUP_ID_UNKNOWN));
        assert!(alarm.is_scheduled());
        assert!(rx.try_recv().is_err());

        time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(rx.try_recv(), Ok(Message::SuspendTimeout(GROUP_ID_UNKNOWN))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut alarm = Alarm::new(tx);

        alarm.schedule(Duration::from_millis(100), Message::SuspendTimeout(1));
        alarm.cancel();
        assert!(!alarm.is_scheduled());

        time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
