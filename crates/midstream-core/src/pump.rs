use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http1::IO_CHUNK_SIZE;

#[derive(Debug)]
pub struct TransferSummary {
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub client_to_target_error: Option<io::Error>,
    pub target_to_client_error: Option<io::Error>,
}

impl TransferSummary {
    pub fn first_error(&self) -> Option<&io::Error> {
        self.client_to_target_error
            .as_ref()
            .or(self.target_to_client_error.as_ref())
    }
}

pub(crate) async fn transfer<C, T>(client: C, target: T) -> TransferSummary
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let ((client_to_target, client_to_target_error), (target_to_client, target_to_client_error)) =
        tokio::join!(
            copy_direction(&mut client_read, &mut target_write),
            copy_direction(&mut target_read, &mut client_write),
        );

    TransferSummary {
        client_to_target,
        target_to_client,
        client_to_target_error,
        target_to_client_error,
    }
}

async fn copy_direction<R, W>(source: &mut R, sink: &mut W) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    let mut total = 0_u64;
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => {
                let _ = sink.shutdown().await;
                return (total, None);
            }
            Ok(read) => {
                if let Err(error) = sink.write_all(&chunk[..read]).await {
                    return (total, Some(error));
                }
                total += read as u64;
            }
            Err(error) => {
                let _ = sink.shutdown().await;
                return (total, Some(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::transfer;

    #[tokio::test]
    async fn pump_counts_each_direction_exactly() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (target_near, mut target_far) = tokio::io::duplex(1024);

        let pump = tokio::spawn(transfer(client_near, target_near));

        client_far.write_all(b"ping-from-client").await.expect("client write");
        client_far.shutdown().await.expect("client shutdown");

        let mut at_target = [0_u8; 16];
        target_far.read_exact(&mut at_target).await.expect("target read");
        assert_eq!(&at_target, b"ping-from-client");

        target_far.write_all(b"pong").await.expect("target write");
        target_far.shutdown().await.expect("target shutdown");

        let mut at_client = Vec::new();
        client_far.read_to_end(&mut at_client).await.expect("client read");
        assert_eq!(at_client, b"pong");

        let summary = pump.await.expect("pump task");
        assert_eq!(summary.client_to_target, 16);
        assert_eq!(summary.target_to_client, 4);
        assert!(summary.first_error().is_none());
    }

    #[tokio::test]
    async fn one_direction_failing_does_not_stop_the_other() {
        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let (target_near, target_far) = tokio::io::duplex(1024);

        // Target's far end goes away immediately; the client->target
        // direction hits EOF/write failure while target->client stays clean.
        drop(target_far);

        let pump = tokio::spawn(transfer(client_near, target_near));

        let _ = client_far.write_all(b"doomed").await;
        client_far.shutdown().await.expect("client shutdown");

        let mut rest = Vec::new();
        let _ = client_far.read_to_end(&mut rest).await;

        let summary = pump.await.expect("pump task");
        assert_eq!(summary.target_to_client, 0);
        assert!(summary.target_to_client_error.is_none());
    }
}
