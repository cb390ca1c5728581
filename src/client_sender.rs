use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::{codec::IrcCodec, mailbox::Mailbox, message::Message, result::Result};

/// Writes everything queued for one client to its socket. An `ERROR` line
/// is the last thing a client is sent.
pub async fn run_sender<W, M>(writer: W, mailbox: &mut M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Mailbox<Message>,
{
    let mut sink = FramedWrite::new(writer, IrcCodec::default());

    while let Some(message) = mailbox.receive().await {
        let last = message.command() == "ERROR";
        sink.send(message).await?;
        if last {
            break;
        }
    }

    sink.close().await?;
    Ok(())
}
