use std::sync::Arc;

use futures::StreamExt;
use tokio::{
    io::AsyncRead,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
    },
    time::{sleep_until, Instant},
};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::{
    codec::{CodecError, IrcCodec},
    connection::{Connection, ConnectionEvent, Flow},
    context::ServerContext,
    message::Message,
    rate_limit::{Admission, FloodGate},
    replies,
    result::Result,
};

/// Reads lines off the client's stream until it goes away, the server
/// shuts down or the connection decides to close. Also drives the
/// keepalive, flood release and capability negotiation timers.
pub async fn run_listener<R>(
    reader: R,
    mut connection: Connection,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    outbound: mpsc::Sender<Message>,
    context: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let codec = IrcCodec::new(context.line_limits(), context.settings.limits.utf8_only);
    let mut lines = FramedRead::new(reader, codec);
    let mut availability = context.availability.subscribe();
    let mut flood = FloodGate::new(&context.settings.flood, Instant::now());

    let ping_frequency = context.ping_frequency();
    let ping_timeout = context.settings.ping_timeout();
    let mut last_activity = Instant::now();
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let now = Instant::now();
        let keepalive = pong_deadline.unwrap_or(last_activity + ping_frequency);
        let release = flood.next_release(now);
        let cap_deadline = connection.cap_deadline();

        let flow = tokio::select! {
            frame = lines.next() => match frame {
                Some(Ok(Ok(message))) => {
                    last_activity = Instant::now();
                    pong_deadline = None;
                    match flood.admit(message, connection.is_registered(), last_activity) {
                        Admission::Ready(message) => connection.handle_message(message).await,
                        Admission::Queued => Flow::Continue,
                        Admission::Flooded => Flow::Close("Excess Flood".to_string()),
                    }
                }
                Some(Ok(Err(error))) => {
                    last_activity = Instant::now();
                    connection.handle_parse_error(error);
                    Flow::Continue
                }
                Some(Err(CodecError::InvalidUtf8)) => Flow::Close("Invalid UTF-8".to_string()),
                Some(Err(error)) => {
                    debug!(connection_id = %connection.id(), %error, "read failed");
                    Flow::Close("Read error".to_string())
                }
                None => Flow::Close("Connection closed".to_string()),
            },
            Some(event) = events.recv() => connection.handle_event(event),
            Ok(()) = availability.changed() => {
                let snapshot = availability.borrow().clone();
                connection.update_availability(snapshot);
                Flow::Continue
            }
            _ = sleep_until(release.unwrap_or(now)), if release.is_some() => {
                let mut flow = Flow::Continue;
                for message in flood.release(Instant::now()) {
                    flow = connection.handle_message(message).await;
                    if flow != Flow::Continue {
                        break;
                    }
                }
                flow
            }
            _ = sleep_until(keepalive) => match pong_deadline {
                Some(_) => Flow::Close(format!("Ping timeout: {} seconds", ping_timeout.as_secs())),
                None => {
                    pong_deadline = Some(Instant::now() + ping_timeout);
                    let ping = replies::ping(context.server_host());
                    match outbound.try_send(ping) {
                        Ok(()) => Flow::Continue,
                        Err(TrySendError::Full(_)) => {
                            warn!(connection_id = %connection.id(), "outbound queue full at keepalive");
                            Flow::Close("SendQ exceeded".to_string())
                        }
                        Err(TrySendError::Closed(_)) => Flow::Close("Write error".to_string()),
                    }
                }
            },
            _ = sleep_until(cap_deadline.unwrap_or(now)), if cap_deadline.is_some() => {
                connection.cap_timeout().await
            }
            _ = shutdown.recv() => Flow::Close("Server shutting down".to_string()),
        };

        if let Flow::Close(reason) = flow {
            break reason;
        }
    };

    connection.close(&reason).await;

    Ok(())
}
