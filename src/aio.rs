//! An asynchronous NATS [`Client`].
//!
//! After creating the `Client`, [`Client::spawn()`] hands back a
//! [`ClientHandle`] and a future. The application is responsible for
//! `await`ing the future and running the client; the handle implements
//! [`Connection`] and plugs straight into a pipeline.
//!
//! ```no_run
//! # #[cfg(feature = "net")]
//! # {
//! use async_net::TcpStream;
//! use sterne::aio::Client;
//! use sterne::{Connection, Message};
//!
//! smol::block_on(async {
//!     let stream = TcpStream::connect("localhost:4222").await.unwrap();
//!     let (mut handle, task) = Client::new(stream).spawn();
//!     let _task = smol::spawn(task);
//!
//!     let (sink, deliveries) = async_channel::bounded::<Message>(100);
//!     handle.subscribe("nova.parsed", sink).await.unwrap();
//!     handle.flush().await.unwrap();
//!
//!     while let Ok(message) = deliveries.recv().await {
//!         println!("{}: {} bytes", message.subject, message.payload.len());
//!     }
//! });
//! # }
//! ```
use crate::broker::{BrokerError, Connection, Message};
use crate::wire::{ClientOp, NatsBinding, ServerOp};
use async_channel::{Receiver, RecvError, Sender};
use futures::future::Either;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::pin_mut;
use log::{debug, error, info, trace};
use std::collections::{HashMap, VecDeque};

#[cfg(feature = "net")]
pub use net::NetConnector;

const READ_BUFFER: usize = 4096;

// Requests a `ClientHandle` forwards into the event loop.
enum Control {
    Subscribe {
        subject: String,
        sink: Sender<Message>,
        done: Sender<()>,
    },
    Flush {
        done: Sender<()>,
    },
}

/// An asynchronous client for one NATS connection.
///
/// See the [module documentation](crate::aio) for more information.
pub struct Client<S: AsyncRead + AsyncWrite + Unpin> {
    // Socket for interacting with the NATS server.
    socket: S,
    binding: NatsBinding,

    subscriptions: HashMap<u64, Sender<Message>>,
    next_sid: u64,
    pending_flushes: VecDeque<Sender<()>>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            binding: NatsBinding::new(),
            subscriptions: HashMap::new(),
            next_sid: 1,
            pending_flushes: VecDeque::new(),
        }
    }

    /// Spawn an event loop that operates on the socket.
    pub fn spawn(
        self,
    ) -> (
        ClientHandle,
        impl std::future::Future<Output = Result<(), std::io::Error>>,
    ) {
        let (sender, receiver) = async_channel::bounded(100);

        let handle = ClientHandle { control: sender };
        (handle, self.run(receiver))
    }

    async fn run(mut self, control: Receiver<Control>) -> Result<(), std::io::Error> {
        // Each turn of the loop: apply queued control requests, write out
        // everything the binding wants transmitted, decode whatever is
        // already buffered, then wait for the socket or the next control
        // request.
        let mut buffer = [0u8; READ_BUFFER];

        loop {
            while let Ok(request) = control.try_recv() {
                self.apply(request);
            }

            let mut wrote = false;
            while let Some(bytes) = self.binding.poll_transmits() {
                trace!("<-- {} bytes", bytes.len());
                self.socket.write_all(&bytes).await?;
                wrote = true;
            }
            if wrote {
                // If the socket is buffered, nothing leaves without this.
                self.socket.flush().await?;
            }

            let mut decoded = false;
            while let Some(op) = self
                .binding
                .poll_op()
                .map_err(std::io::Error::other)?
            {
                self.process(op).await;
                decoded = true;
            }
            if decoded {
                // Processing may have queued transmits (PONG, UNSUB); write
                // them before blocking on the socket again.
                continue;
            }

            enum Winner {
                Read(Result<usize, std::io::Error>),
                Control(Result<Control, RecvError>),
            }

            let winner = {
                let read = async { Winner::Read(self.socket.read(&mut buffer).await) };
                let request = async { Winner::Control(control.recv().await) };
                pin_mut!(read, request);

                match futures::future::select(read, request).await {
                    Either::Left((winner, _)) | Either::Right((winner, _)) => winner,
                }
            };

            match winner {
                Winner::Read(Ok(0)) => {
                    return Err(std::io::Error::other("the server closed the connection"));
                }
                Winner::Read(Ok(count)) => {
                    trace!("--> {count} bytes");
                    self.binding.receive(&buffer[..count]);
                }
                Winner::Read(Err(error)) => {
                    return Err(error);
                }
                Winner::Control(Ok(request)) => self.apply(request),
                Winner::Control(Err(_)) => {
                    // Every handle is gone; nobody can use this connection
                    // anymore.
                    info!("All client handles dropped, closing the connection.");
                    return Ok(());
                }
            }
        }
    }

    fn apply(&mut self, request: Control) {
        match request {
            Control::Subscribe {
                subject,
                sink,
                done,
            } => {
                let sid = self.next_sid;
                self.next_sid += 1;

                debug!("Subscribing to {subject:?} with sid {sid}");
                self.binding.send(ClientOp::Sub { subject, sid });
                self.subscriptions.insert(sid, sink);
                let _ = done.try_send(());
            }
            Control::Flush { done } => {
                self.binding.send(ClientOp::Ping);
                self.pending_flushes.push_back(done);
            }
        }
    }

    async fn process(&mut self, op: ServerOp) {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                payload,
                ..
            } => {
                let Some(sink) = self.subscriptions.get(&sid).cloned() else {
                    debug!("Dropping message for unknown sid {sid}");
                    return;
                };
                if sink.send(Message { subject, payload }).await.is_err() {
                    // The receiving side is gone; stop the server from
                    // sending more.
                    debug!("Sink for sid {sid} is closed, unsubscribing");
                    self.subscriptions.remove(&sid);
                    self.binding.send(ClientOp::Unsub { sid });
                }
            }
            ServerOp::Pong => {
                if let Some(done) = self.pending_flushes.pop_front() {
                    let _ = done.try_send(());
                }
            }
            ServerOp::Err(message) => {
                error!("Server error: {message}");
            }
            ServerOp::Info(..) | ServerOp::Ping | ServerOp::Ok => {}
        }
    }
}

/// A handle to interact with a [`Client`].
///
/// Cloning is cheap; all clones talk to the same connection.
#[derive(Clone)]
pub struct ClientHandle {
    control: Sender<Control>,
}

impl Connection for ClientHandle {
    async fn subscribe(
        &mut self,
        subject: &str,
        sink: Sender<Message>,
    ) -> Result<(), BrokerError> {
        let (done, confirmed) = async_channel::bounded(1);
        self.control
            .send(Control::Subscribe {
                subject: subject.to_string(),
                sink,
                done,
            })
            .await
            .map_err(|_| BrokerError::new("the client task is gone"))?;
        confirmed
            .recv()
            .await
            .map_err(|_| BrokerError::new("the client task dropped the subscription"))?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        let (done, confirmed) = async_channel::bounded(1);
        self.control
            .send(Control::Flush { done })
            .await
            .map_err(|_| BrokerError::new("the client task is gone"))?;
        confirmed
            .recv()
            .await
            .map_err(|_| BrokerError::new("the client task is gone"))?;
        Ok(())
    }
}

#[cfg(feature = "net")]
mod net {
    use super::Client;
    use crate::broker::{BrokerError, Connector};
    use log::error;

    /// Connects to a broker endpoint over TCP and runs the client on the
    /// smol executor.
    #[derive(Default)]
    pub struct NetConnector(());

    impl NetConnector {
        pub fn new() -> Self {
            Self(())
        }
    }

    impl Connector for NetConnector {
        type Connection = super::ClientHandle;

        async fn connect(&mut self, server: &str) -> Result<Self::Connection, BrokerError> {
            let address = server.strip_prefix("nats://").unwrap_or(server);
            let stream = async_net::TcpStream::connect(address).await?;

            let (handle, task) = Client::new(stream).spawn();
            smol::spawn(async move {
                if let Err(error) = task.await {
                    error!("NATS client task failed: {error}");
                }
            })
            .detach();

            Ok(handle)
        }
    }
}
