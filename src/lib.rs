//! lariat: a NATS client core.
//!
//! The crate drives one connection over any `AsyncRead + AsyncWrite` duplex
//! (TCP, TLS, an in-process pipe); connecting sockets, reconnect loops, and
//! authentication live with the caller.  What lives here is the
//! subscription-side pipeline (framing, dispatch, per-subscription pending
//! limits, queue groups, request/reply) and the JetStream pull-consumer
//! protocol with its simplified fetch/consume shapes and the ack verbs.
//!
//! ```no_run
//! # async fn example() -> lariat::Result<()> {
//! use lariat::{Client, ClientOptions};
//!
//! let socket = tokio::net::TcpStream::connect("127.0.0.1:4222").await?;
//! let client = Client::connect(socket, ClientOptions::default()).await?;
//!
//! let mut sub = client.subscribe("orders.>").await?;
//! client.publish("orders.created", "hello").await?;
//! let message = sub.recv().await?;
//!
//! let consumer = client.jetstream().consumer("ORDERS", "worker")?;
//! let mut batch = consumer.fetch_max(10).await?;
//! while let Some(message) = batch.next().await? {
//!     message.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;
mod dispatcher;
mod error;
mod events;
mod inbox;
mod managers;
mod options;
mod subscription;

pub mod jetstream;

pub use client::Client;
pub use error::{Error, Result};
pub use events::ClientEvent;
pub use options::{ClientOptions, SubscribeOptions};
pub use subscription::{HandlerSubscription, Subscriber};

// Wire-level types callers interact with directly.
pub use lariat_proto::jetstream::{AckMetadata, PullRequest};
pub use lariat_proto::{HeaderMap, Message, ServerInfo, StatusCode};
