use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::logger::Logger;
use crate::server::broadcaster::Broadcaster;
use crate::server::message::Message;

/// Operator input: every chunk read goes to all peers, tagged as the operator's.
pub struct OperatorConsole<R> {
    input: R,
    broadcaster: Broadcaster,
    buffer_size: usize,
    logger: Logger,
}

impl<R> OperatorConsole<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(input: R, broadcaster: Broadcaster, buffer_size: usize, logger: Logger) -> Self {
        OperatorConsole {
            input,
            broadcaster,
            buffer_size: buffer_size.max(1),
            logger,
        }
    }

    /// Read until EOF or error. Returns how many chunks were broadcast.
    pub async fn run(mut self) -> u64 {
        let mut buf = vec![0u8; self.buffer_size];
        let mut sent = 0;

        loop {
            match self.input.read(&mut buf).await {
                Ok(0) => {
                    self.logger.info("⌨️ Operator input closed; console stopped.");
                    break;
                }
                Ok(n) => {
                    let message = Message::from_operator(Bytes::copy_from_slice(&buf[..n]));
                    self.broadcaster.send_all(message).await;
                    sent += 1;
                }
                Err(e) => {
                    self.logger.warn(&format!("❌ Failed to read operator input: {}", e));
                    break;
                }
            }
        }
        sent
    }

    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }
}
