//! Terminal spinner for long provisioning waits.

use std::io::Write;
use std::time::Duration;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

pub struct Spinner {
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        let message = message.to_string();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(120));
            let mut i = 0usize;
            tokio::pin!(stop_rx);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        eprint!("\r{} {}", message, FRAMES[i % FRAMES.len()]);
                        let _ = std::io::stderr().flush();
                        i += 1;
                    }
                }
            }
            let clear = " ".repeat(message.chars().count() + 2);
            eprint!("\r{clear}\r");
            let _ = std::io::stderr().flush();
        });
        Spinner {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}
