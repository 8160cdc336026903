use std::net::{IpAddr, SocketAddr};

use std::time::Duration;

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_stream::Stream;

use crate::{
    smtp::{Response, Session},
    Auth, Config, ReceivedMail,
};

/// The pause after a failed `accept`.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

type Sender = mpsc::UnboundedSender<Result<ReceivedMail, Error>>;

/// An error while receiving email.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Smtp(#[from] crate::smtp::Error),
    #[error(transparent)]
    Parse(#[from] crate::received::ParseError),
    #[error(transparent)]
    Accept(#[from] std::io::Error),
    #[error("server stopped accepting connections")]
    Closed,
}

/// An SMTP server that keeps the email it receives
/// so tests can inspect it.
///
/// Connections are accepted in the background
/// from the moment the server is started
/// until it is dropped.
pub struct Server {
    auth: Auth,
    address: SocketAddr,
    acceptor: JoinHandle<()>,
    channel_rx: mpsc::UnboundedReceiver<Result<ReceivedMail, Error>>,
}

impl Server {
    /// Start a new server instance.
    ///
    /// Bind to port `0` to let the system pick a free port,
    /// then use [`Server::address`] to find it.
    pub async fn start(
        address: SocketAddr,
        auth: Auth,
    ) -> Result<Self, std::io::Error> {
        use tokio::net::TcpListener;
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?;
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept(
            listener,
            address.ip(),
            auth.clone(),
            channel_tx,
        ));
        Ok(Self {
            auth,
            address,
            acceptor,
            channel_rx,
        })
    }

    /// Start a new server instance
    /// with the given configuration.
    ///
    /// The `strict` argument specifies
    /// what to do if no login credentials
    /// were provided in the config.
    /// If `true`, only anonymous clients
    /// are allowed. If `false`
    /// all clients are allowed,
    /// even if they provide login credentials.
    pub async fn start_with_config(
        config: Config<IpAddr>,
        strict: bool,
    ) -> Result<Self, std::io::Error> {
        let address = SocketAddr::new(config.address, config.port_or_default());
        let auth = config
            .credentials
            .map(|(username, password)| Auth::Login { username, password })
            .unwrap_or(if strict {
                Auth::AcceptAnonOnly
            } else {
                Auth::AcceptAll
            });
        Self::start(address, auth).await
    }

    /// Return the address and port to which this server bound.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// A client configuration that reaches this server,
    /// including its login if it requires one.
    pub fn client_config(&self) -> Config<String> {
        let credentials = match &self.auth {
            Auth::Login { username, password } => {
                Some((username.clone(), password.clone()))
            }
            Auth::AcceptAnonOnly | Auth::AcceptAll => None,
        };
        Config {
            address: self.address.ip().to_string(),
            port: Some(self.address.port()),
            credentials,
        }
    }

    /// Create a stream of emails.
    ///
    /// This stream discards any errors that occur.
    pub fn stream(&mut self) -> impl Stream<Item = ReceivedMail> + '_ {
        async_stream::stream! {
            loop {
                yield self.receive().await;
            }
        }
    }

    /// Create a stream of emails.
    ///
    /// This stream includes any errors that occur
    /// and ends once the server stops accepting connections.
    pub fn try_stream(
        &mut self,
    ) -> impl Stream<Item = Result<ReceivedMail, Error>> + '_ {
        async_stream::stream! {
            while let Some(result) = self.channel_rx.recv().await {
                yield result;
            }
        }
    }

    /// Receive a single email.
    ///
    /// This method discards any errors that occur.
    pub async fn receive(&mut self) -> ReceivedMail {
        loop {
            match self.try_receive().await {
                Ok(email) => return email,
                // nothing can arrive anymore
                Err(Error::Closed) => std::future::pending::<()>().await,
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    {
                        use tracing::{event, Level};
                        event!(Level::TRACE, ?error);
                    }
                }
            }
        }
    }

    /// Try to receive a single email.
    pub async fn try_receive(&mut self) -> Result<ReceivedMail, Error> {
        self.channel_rx.recv().await.unwrap_or(Err(Error::Closed))
    }

    /// Take all email received so far without waiting.
    ///
    /// Errors are discarded. Once a client has been told
    /// its email was accepted, the email is available here.
    pub fn received_messages(&mut self) -> Vec<ReceivedMail> {
        let mut emails = Vec::new();
        while let Ok(result) = self.channel_rx.try_recv() {
            match result {
                Ok(email) => emails.push(email),
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    {
                        use tracing::{event, Level};
                        event!(Level::TRACE, ?error);
                    }
                }
            }
        }
        emails
    }
}

impl Drop for Server {
    /// Stop accepting and close all open connections.
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept(
    listener: tokio::net::TcpListener,
    server_ip: IpAddr,
    auth: Auth,
    channel: Sender,
) {
    // dropping the set aborts the sessions still running
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((socket, _client_address)) => {
                    sessions.spawn(task(
                        socket,
                        server_ip,
                        auth.clone(),
                        channel.clone(),
                    ));
                }
                Err(e) => {
                    if !report_accept_error(&channel, e).await {
                        return;
                    }
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

/// Hand an accept error to the receiver and pause before accepting again,
/// so a lasting failure such as running out of file descriptors
/// does not flood the channel.
///
/// Returns `false` once the server is gone.
async fn report_accept_error(channel: &Sender, error: std::io::Error) -> bool {
    if channel.send(Err(Error::Accept(error))).is_err() {
        return false;
    }
    tokio::time::sleep(ACCEPT_RETRY).await;
    true
}

async fn task(
    socket: tokio::net::TcpStream,
    server_ip: IpAddr,
    auth: Auth,
    channel: Sender,
) {
    let mut session = Session::new(socket, server_ip.to_string(), auth);
    if let Err(e) = session.greet().await {
        let _ = channel.send(Err(e.into()));
        return;
    }
    loop {
        let result = match session.next().await {
            Ok(Response::Email(data)) => {
                channel.send(ReceivedMail::parse(data).map_err(Error::from))
            }
            Ok(Response::Quit) => return,
            Err(e) => {
                let _ = channel.send(Err(e.into()));
                return;
            }
        };
        if result.is_err() {
            // the server is gone
            // NOTE: just close the socket without sending a smtp `quit`
            return;
        }
    }
}
