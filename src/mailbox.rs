use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// The receiving end of an actor. Lets actors run against a canned queue
/// in tests.
#[async_trait]
pub trait Mailbox<T>: Send
where
    T: Send,
{
    async fn receive(&mut self) -> Option<T>;
}

#[async_trait]
impl<T> Mailbox<T> for mpsc::Receiver<T>
where
    T: Send,
{
    async fn receive(&mut self) -> Option<T> {
        self.recv().await
    }
}

#[async_trait]
impl<T> Mailbox<T> for mpsc::UnboundedReceiver<T>
where
    T: Send,
{
    async fn receive(&mut self) -> Option<T> {
        self.recv().await
    }
}

/// Yields the queued items in order, then reports the mailbox closed.
pub struct FakeMailbox<T> {
    pub queued: VecDeque<T>,
    pub receive_count: usize,
}

impl<T> FakeMailbox<T> {
    pub fn new<I: IntoIterator<Item = T>>(items: I) -> Self {
        FakeMailbox {
            queued: items.into_iter().collect(),
            receive_count: 0,
        }
    }
}

#[async_trait]
impl<T> Mailbox<T> for FakeMailbox<T>
where
    T: Send,
{
    async fn receive(&mut self) -> Option<T> {
        self.receive_count += 1;
        self.queued.pop_front()
    }
}
