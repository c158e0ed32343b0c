//! Websocket connection to a gradio queue endpoint.
//!
//! One `Connection` is opened per invocation phase. The server closes the
//! socket after `process_completed`, so connections are never reused.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::error::{ConnectError, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on how much of a rejected handshake body is kept for diagnostics
const MAX_REJECTION_BODY: usize = 4096;

/// Lifecycle of a queue connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A single websocket connection to `ws://<host>/queue/join`
pub struct Connection {
    status: ConnectionStatus,
    url: String,
    socket: Option<WsStream>,
}

impl Connection {
    /// A disconnected connection to the queue endpoint of `host` (`host:port`)
    pub fn new(host: &str) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            url: queue_url(host),
            socket: None,
        }
    }

    /// Perform the websocket handshake
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.status = ConnectionStatus::Connecting;
        debug!(url = %self.url, "Opening queue connection");

        let request = match build_request(&self.url) {
            Ok(request) => request,
            Err(source) => {
                self.status = ConnectionStatus::Error;
                return Err(ConnectError::Dial {
                    url: self.url.clone(),
                    source,
                });
            }
        };

        match tokio_tungstenite::connect_async(request).await {
            Ok((socket, response)) => {
                debug!(url = %self.url, status = %response.status(), "Queue connection open");
                self.socket = Some(socket);
                self.status = ConnectionStatus::Connected;
                Ok(())
            }
            Err(tungstenite::Error::Http(response)) => {
                self.status = ConnectionStatus::Error;
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .map(|body| {
                        String::from_utf8_lossy(&body[..body.len().min(MAX_REJECTION_BODY)])
                            .into_owned()
                    })
                    .unwrap_or_default();
                error!(url = %self.url, status, body = %body, "Queue handshake rejected");
                Err(ConnectError::Rejected {
                    url: self.url.clone(),
                    status,
                    body,
                })
            }
            Err(source) => {
                self.status = ConnectionStatus::Error;
                error!(url = %self.url, error = %source, "Queue connection failed");
                Err(ConnectError::Dial {
                    url: self.url.clone(),
                    source,
                })
            }
        }
    }

    #[allow(dead_code)] // Useful for monitoring/debugging
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Write one text frame
    #[allow(dead_code)]
    pub async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(TransportError::Write)
    }

    /// Wait for the next data frame
    #[allow(dead_code)]
    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        next_frame(socket).await
    }

    /// Hand the two halves of the socket to separate tasks
    pub fn split(&mut self) -> Result<(FrameWriter, FrameReader), TransportError> {
        let socket = self.socket.take().ok_or(TransportError::NotConnected)?;
        let (sink, stream) = socket.split();
        Ok((FrameWriter { sink }, FrameReader { stream }))
    }

    /// Take back the halves produced by [`Connection::split`]
    pub fn rejoin(&mut self, writer: FrameWriter, reader: FrameReader) {
        match reader.stream.reunite(writer.sink) {
            Ok(socket) => self.socket = Some(socket),
            Err(e) => {
                warn!(url = %self.url, error = %e, "Socket halves do not belong together");
                self.status = ConnectionStatus::Error;
            }
        }
    }

    /// Close the socket. Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take()
            && let Err(e) = socket.close(None).await
        {
            // The server usually hangs up first after process_completed
            debug!(url = %self.url, error = %e, "Error while closing queue connection");
        }
        if self.status != ConnectionStatus::Error {
            self.status = ConnectionStatus::Disconnected;
        }
    }
}

/// Write half of a split connection
pub struct FrameWriter {
    sink: SplitSink<WsStream, Message>,
}

impl FrameWriter {
    pub async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(TransportError::Write)
    }
}

/// Read half of a split connection
pub struct FrameReader {
    stream: SplitStream<WsStream>,
}

impl FrameReader {
    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        next_frame(&mut self.stream).await
    }
}

async fn next_frame<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(frame = ?frame, "Queue connection closed by remote");
                return Err(TransportError::Closed);
            }
            Some(Err(e)) => return Err(TransportError::Read(e)),
            None => return Err(TransportError::Closed),
        }
    }
}

fn queue_url(host: &str) -> String {
    format!("ws://{}/queue/join", host.trim_end_matches('/'))
}

/// The queue endpoint behind some reverse proxies rejects bare clients, so
/// present the same headers a browser would.
fn build_request(
    url: &str,
) -> Result<tungstenite::handshake::client::Request, tungstenite::Error> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("Accept", HeaderValue::from_static("*/*"));
    headers.insert("Accept-Language", HeaderValue::from_static("en-GB,en;q=0.5"));
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Pragma", HeaderValue::from_static("no-cache"));
    Ok(request)
}
