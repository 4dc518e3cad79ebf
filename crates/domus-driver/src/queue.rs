use std::collections::VecDeque;
use std::sync::Arc;

use domus::stage::QueryStage;

use parking_lot::Mutex;

use crate::event::EventSignal;

/// An HTTP method used to send a request to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET` method.
    Get,
    /// `POST` method.
    Post,
    /// `PUT` method.
    Put,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Method {
    /// Returns the [`Method`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

/// A request to be sent to a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    params: Option<String>,
}

impl Request {
    /// Creates a `GET` [`Request`] for the given path.
    #[must_use]
    #[inline]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, None)
    }

    /// Creates a [`Request`].
    ///
    /// Parameters, when present, are sent as the request body.
    #[must_use]
    #[inline]
    pub fn new(method: Method, path: impl Into<String>, params: Option<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params,
        }
    }

    /// Returns the request [`Method`].
    #[must_use]
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Returns the request path, query included.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the request body, if any.
    #[must_use]
    #[inline]
    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }
}

/// A unit of outbound work processed by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageQueueItem {
    /// Send a request to the controller.
    SendRequest(Request),
    /// Acknowledge that a node has done all the work of a discovery stage.
    QueryStageComplete {
        /// Node identifier.
        node_id: String,
        /// The completed stage.
        stage: QueryStage,
    },
}

/// The channels of a driver's outbound work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Requests issued on behalf of users and node discovery.
    Command,
    /// Discovery stage acknowledgements.
    Query,
}

impl QueueKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Command => "Command Queue",
            Self::Query => "Query Queue",
        }
    }
}

/// A FIFO of [`MessageQueueItem`]s paired with an [`EventSignal`].
///
/// The signal is set if and only if the queue is not empty. Both the
/// contents and the signal state only change under the queue lock.
#[derive(Debug)]
pub struct MessageQueue {
    items: Mutex<VecDeque<MessageQueueItem>>,
    signal: Arc<EventSignal>,
}

impl MessageQueue {
    /// Creates an empty [`MessageQueue`] for the given channel.
    #[must_use]
    pub fn new(kind: QueueKind) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            signal: Arc::new(EventSignal::new(kind.name())),
        }
    }

    /// Appends an item at the tail of the queue.
    pub fn enqueue(&self, item: MessageQueueItem) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.signal.set();
    }

    /// Removes the item at the head of the queue.
    ///
    /// The queue signal is cleared when the queue becomes empty.
    pub fn dequeue(&self) -> Option<MessageQueueItem> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if items.is_empty() {
            self.signal.clear();
        }
        item
    }

    /// Returns the number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Checks whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes all queued items.
    pub fn clear(&self) {
        let mut items = self.items.lock();
        items.clear();
        self.signal.clear();
    }

    /// Returns the signal set while the queue is not empty.
    #[must_use]
    #[inline]
    pub fn signal(&self) -> &EventSignal {
        &self.signal
    }
}
