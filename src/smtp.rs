use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};

/// The longest line accepted, including the trailing `CRLF`.
const MAX_LINE_LENGTH: usize = 1000;

/// An error during an SMTP exchange.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line exceeds {max} octets")]
    LineTooLong { max: usize },
    #[error("connection closed during mail data")]
    ConnectionClosed,
}

/// The authentication details for an SMTP server.
#[derive(Clone, Debug)]
pub enum Auth {
    /// Require clients to login with the provided credentials.
    Login { username: String, password: String },
    /// Accept only anonymous clients.
    AcceptAnonOnly,
    /// Accept any client, even ones that try to login using credentials.
    AcceptAll,
}

#[derive(Debug)]
pub(crate) enum Response<T> {
    Email(T),
    Quit,
}

#[derive(Debug)]
pub(crate) struct Data {
    pub email: Vec<u8>,
    pub address_from: String,
    pub addresses_to: Vec<String>,
}

/// The server side of one SMTP connection.
pub(crate) struct Session<S> {
    socket: BufReader<S>,
    name: String,
    auth: Auth,
    greeted: bool,
    authenticated: bool,
    address_from: Option<String>,
    addresses_to: Vec<String>,
    /// A received mail that still needs its `250`.
    pending_ack: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(socket: S, name: impl Into<String>, auth: Auth) -> Self {
        Self {
            socket: BufReader::new(socket),
            name: name.into(),
            auth,
            greeted: false,
            authenticated: false,
            address_from: None,
            addresses_to: Vec::new(),
            pending_ack: false,
        }
    }

    pub async fn greet(&mut self) -> Result<(), Error> {
        let greeting = format!("220 {} ESMTP\r\n", self.name);
        self.write(&greeting).await
    }

    /// Handle commands until a mail is received or the client leaves.
    ///
    /// A received mail is only acknowledged
    /// on the next call, so the caller can hand it on first.
    pub async fn next(&mut self) -> Result<Response<Data>, Error> {
        if self.pending_ack {
            self.pending_ack = false;
            self.write("250 Ok\r\n").await?;
        }
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(Response::Quit);
            };
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));
            match verb.to_ascii_uppercase().as_str() {
                "EHLO" => {
                    self.greeted = true;
                    self.reset();
                    let reply = format!("250-{}\r\n250 AUTH PLAIN\r\n", self.name);
                    self.write(&reply).await?;
                }
                "HELO" => {
                    self.greeted = true;
                    self.reset();
                    let reply = format!("250 {}\r\n", self.name);
                    self.write(&reply).await?;
                }
                "AUTH" => self.authenticate(argument).await?,
                "MAIL" => {
                    if !self.greeted {
                        self.write("503 Send EHLO first\r\n").await?;
                    } else if self.requires_login() {
                        self.write("530 Authentication required\r\n").await?;
                    } else if let Some(address) = parse_path(argument, "FROM") {
                        self.reset();
                        self.address_from = Some(address);
                        self.write("250 Ok\r\n").await?;
                    } else {
                        self.write("501 Syntax: MAIL FROM:<address>\r\n").await?;
                    }
                }
                "RCPT" => {
                    if self.address_from.is_none() {
                        self.write("503 Send MAIL first\r\n").await?;
                    } else {
                        match parse_path(argument, "TO") {
                            Some(address) if !address.is_empty() => {
                                self.addresses_to.push(address);
                                self.write("250 Ok\r\n").await?;
                            }
                            _ => {
                                self.write("501 Syntax: RCPT TO:<address>\r\n")
                                    .await?;
                            }
                        }
                    }
                }
                "DATA" => {
                    if self.addresses_to.is_empty() {
                        self.write("503 Send RCPT first\r\n").await?;
                        continue;
                    }
                    self.write("354 Go\r\n").await?;
                    let email = self.read_data().await?;
                    self.pending_ack = true;
                    return Ok(Response::Email(Data {
                        email,
                        address_from: self.address_from.take().unwrap_or_default(),
                        addresses_to: std::mem::take(&mut self.addresses_to),
                    }));
                }
                "RSET" => {
                    self.reset();
                    self.write("250 Ok\r\n").await?;
                }
                "NOOP" => self.write("250 Ok\r\n").await?,
                "QUIT" => {
                    self.write("221 Ok\r\n").await?;
                    return Ok(Response::Quit);
                }
                _ => self.write("500 Command not recognized\r\n").await?,
            }
        }
    }

    fn reset(&mut self) {
        self.address_from = None;
        self.addresses_to.clear();
    }

    fn requires_login(&self) -> bool {
        matches!(self.auth, Auth::Login { .. }) && !self.authenticated
    }

    async fn authenticate(&mut self, argument: &str) -> Result<(), Error> {
        if self.authenticated {
            return self.write("503 Already authenticated\r\n").await;
        }
        let (mechanism, initial) =
            argument.split_once(' ').unwrap_or((argument, ""));
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return self
                .write("504 Unrecognized authentication type\r\n")
                .await;
        }
        let response = if initial.is_empty() {
            self.write("334 \r\n").await?;
            match self.read_line().await? {
                Some(line) => String::from_utf8_lossy(&line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
                None => return Ok(()),
            }
        } else {
            initial.to_string()
        };
        let accepted = match &self.auth {
            Auth::Login { username, password } => {
                response == encode_password(username, password)
            }
            Auth::AcceptAnonOnly => false,
            Auth::AcceptAll => true,
        };
        if accepted {
            self.authenticated = true;
            self.write("235 Authentication successful\r\n").await
        } else {
            self.write("535 Authentication failed\r\n").await
        }
    }

    /// Read the mail data up to the terminating `.` line,
    /// undoing dot-stuffing.
    async fn read_data(&mut self) -> Result<Vec<u8>, Error> {
        let mut email = Vec::with_capacity(16 * 1024);
        loop {
            let line = self.read_line().await?.ok_or(Error::ConnectionClosed)?;
            if line == b".\r\n" || line == b".\n" {
                return Ok(email);
            }
            match line.strip_prefix(b".") {
                Some(unstuffed) => email.extend_from_slice(unstuffed),
                None => email.extend_from_slice(&line),
            }
        }
    }

    /// Read a line including its terminator,
    /// or `None` at the end of the stream.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut line = Vec::with_capacity(128);
        let len = (&mut self.socket)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if len == 0 {
            return Ok(None);
        }
        if len == MAX_LINE_LENGTH && line.last() != Some(&b'\n') {
            let _ = self.write("500 Line too long\r\n").await;
            return Err(Error::LineTooLong {
                max: MAX_LINE_LENGTH,
            });
        }
        #[cfg(feature = "tracing")]
        {
            use tracing::{event, Level};
            event!(Level::TRACE, recv = %String::from_utf8_lossy(&line));
        }
        Ok(Some(line))
    }

    async fn write(&mut self, data: &str) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        {
            use tracing::{event, Level};
            event!(Level::TRACE, send = data);
        }

        self.socket.write_all(data.as_bytes()).await?;
        self.socket.flush().await?;
        Ok(())
    }
}

/// Extract the address from `FROM:<address>` or `TO:<address>`,
/// ignoring any trailing parameters.
fn parse_path(argument: &str, keyword: &str) -> Option<String> {
    let (head, rest) = argument.split_once(':')?;
    if !head.trim().eq_ignore_ascii_case(keyword) {
        return None;
    }
    let path = rest.trim_start().strip_prefix('<')?;
    let end = path.find('>')?;
    Some(path[..end].to_string())
}

fn encode_password(username: &str, password: &str) -> String {
    use base64ct::Encoding;
    let mut data = Vec::with_capacity(2 + username.len() + password.len());
    data.push(0);
    data.extend(username.bytes());
    data.push(0);
    data.extend(password.bytes());
    base64ct::Base64::encode_string(&data)
}
