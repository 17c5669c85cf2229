use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logger::Logger;

/// Single writer for the local copy of peer traffic.
///
/// Sessions hand chunks over with `try_send`; one task writes them in
/// arrival order, so chunks never interleave and a blocked stdout never
/// holds up a session.
#[derive(Clone)]
pub struct Mirror {
    tx: mpsc::Sender<Bytes>,
    logger: Logger,
}

impl Mirror {
    pub fn spawn<W>(mut out: W, capacity: usize, logger: Logger) -> (Mirror, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let task_logger = logger.clone();

        let handle = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let written = async {
                    out.write_all(&chunk).await?;
                    out.flush().await
                };
                if let Err(e) = written.await {
                    task_logger.warn(&format!("Failed to mirror message: {}", e));
                }
            }
        });

        (Mirror { tx, logger }, handle)
    }

    /// Queue a chunk; dropped (and logged) when the mirror is backed up.
    pub fn push(&self, chunk: Bytes) {
        if let Err(e) = self.tx.try_send(chunk) {
            self.logger.debug(&format!("Mirror skipped a chunk: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};
    use tokio::time::timeout;

    #[tokio::test]
    async fn chunks_from_many_sources_stay_whole() {
        let (out, mut local) = duplex(1 << 16);
        let (mirror, task) = Mirror::spawn(out, 64, Logger);

        let mut writers = Vec::new();
        for i in 0..4u8 {
            let mirror = mirror.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..8 {
                    mirror.push(Bytes::from(vec![b'a' + i; 512]));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for w in writers {
            w.await.unwrap();
        }
        drop(mirror);
        task.await.unwrap();

        let mut got = Vec::new();
        local.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), 4 * 8 * 512);
        for chunk in got.chunks(512) {
            assert!(chunk.iter().all(|b| *b == chunk[0]), "chunk was split by another source");
        }
    }

    #[tokio::test]
    async fn blocked_output_does_not_block_push() {
        // Nobody reads `_local`: the writer task stalls after 8 bytes
        let (out, _local) = duplex(8);
        let (mirror, _task) = Mirror::spawn(out, 2, Logger);

        timeout(Duration::from_secs(1), async {
            for _ in 0..100 {
                mirror.push(Bytes::from_static(b"0123456789"));
            }
        })
        .await
        .expect("push must never wait on the output");
    }
}
