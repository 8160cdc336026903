use std::sync::Arc;

use lettre::{
    transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};

use crate::{Config, ConfigError, Mail};

type Transport = AsyncSmtpTransport<Tokio1Executor>;

/// An error while sending a [`Mail`].
#[derive(thiserror::Error, Debug)]
pub enum MessagingError {
    #[error("invalid address {address:?}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error(transparent)]
    Build(#[from] lettre::error::Error),
    /// Connecting, logging in, or a negative reply from the server.
    #[error(transparent)]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Sends [`Mail`] to a single SMTP server.
///
/// The connection is unencrypted and a new one
/// is opened for every mail.
#[derive(Clone)]
pub struct MailService {
    transport: Arc<Transport>,
}

impl MailService {
    /// Create a service for the server in `config`,
    /// logging in with its credentials if there are any.
    pub fn new(config: &Config<String>) -> Self {
        let mut builder = Transport::builder_dangerous(config.address.as_str())
            .port(config.port_or_default());
        if let Some((username, password)) = &config.credentials {
            builder = builder
                .credentials(Credentials::new(username.clone(), password.clone()));
        }
        Self {
            transport: Arc::new(builder.build()),
        }
    }

    /// Create a service configured from the environment.
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(&Config::from_env()?))
    }

    /// Send a single mail.
    ///
    /// Returns once the server has accepted the message.
    /// Nothing is retried.
    pub async fn send_mail(&self, mail: Mail) -> Result<(), MessagingError> {
        let message = mail.to_message()?;
        self.transport.send(message).await?;
        #[cfg(feature = "tracing")]
        {
            use tracing::{event, Level};
            event!(
                Level::DEBUG,
                to = %mail.to,
                subject = %mail.subject,
                "mail sent"
            );
        }
        Ok(())
    }

    /// Check that the server can be reached
    /// and accepts the configured credentials.
    pub async fn test_connection(&self) -> Result<bool, MessagingError> {
        Ok(self.transport.test_connection().await?)
    }
}

#[cfg(all(test, feature = "test-server"))]
mod tests {
    use std::time::Duration;

    use super::{MailService, MessagingError};
    use crate::{Auth, Config, Mail, Server};

    const TIMEOUT: Duration = Duration::from_millis(1000);

    async fn start_server(auth: Auth) -> Server {
        Server::start("127.0.0.1:0".parse().unwrap(), auth)
            .await
            .unwrap()
    }

    async fn timeout<F>(op: &str, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        tokio::time::timeout(TIMEOUT, future)
            .await
            .unwrap_or_else(|_| panic!("timeout {op}"))
    }

    async fn expect_timeout<F>(op: &str, future: F)
    where
        F: std::future::Future,
        F::Output: std::fmt::Debug,
    {
        if let Ok(output) = tokio::time::timeout(TIMEOUT, future).await {
            panic!("expected timeout {op}, unexpected output: {output:?}");
        }
    }

    fn mail() -> Mail {
        Mail::new("no-reply@example.com", "info@example.com", "Test", "Hello")
    }

    fn login() -> Auth {
        Auth::Login {
            username: "user".to_string(),
            password: "pwd".to_string(),
        }
    }

    #[tokio::test]
    async fn send_single_mail() {
        let mut server = start_server(Auth::AcceptAnonOnly).await;
        let service = MailService::new(&server.client_config());

        timeout("sending mail", service.send_mail(mail()))
            .await
            .expect("error sending mail");

        let received = server.received_messages();
        assert_eq!(received.len(), 1);
        let email = &received[0];
        assert_eq!(email.subject, "Test");
        assert_eq!(email.recipient(), Some("info@example.com"));
        assert_eq!(email.addresses_to, vec!["info@example.com".to_string()]);
        assert_eq!(email.address_from, "no-reply@example.com");
        assert!(email.body.contains("Hello"));
    }

    #[tokio::test]
    async fn send_then_receive_exactly_once() {
        let mut server = start_server(Auth::AcceptAll).await;
        let service = MailService::new(&server.client_config());
        let mail = Mail::new(
            "Sender <no-reply@example.com>",
            "Recipient <info@example.com>",
            "Spring Mail Integration Testing",
            "We show how to write integration tests.",
        );

        timeout("sending mail", service.send_mail(mail.clone()))
            .await
            .expect("error sending mail");

        let email = timeout("receiving mail", server.try_receive())
            .await
            .expect("error receiving mail");
        assert_eq!(email.subject, mail.subject);
        assert_eq!(email.recipient(), Some("info@example.com"));
        assert_eq!(email.get_from(), Some("Sender <no-reply@example.com>"));
        assert_eq!(email.get_to(), Some("Recipient <info@example.com>"));
        assert!(email.body.contains(&mail.content));

        expect_timeout("receiving second mail", server.try_receive()).await;
    }

    #[tokio::test]
    async fn send_two_mails() {
        let mut server = start_server(Auth::AcceptAnonOnly).await;
        let service = MailService::new(&server.client_config());

        let mut second = mail();
        second.set_subject("Second");
        service.send_mail(mail()).await.unwrap();
        service.send_mail(second).await.unwrap();

        let subjects: Vec<_> = server
            .received_messages()
            .into_iter()
            .map(|email| email.subject)
            .collect();
        assert_eq!(subjects, vec!["Test".to_string(), "Second".to_string()]);
    }

    #[tokio::test]
    async fn send_non_ascii() {
        let mut server = start_server(Auth::AcceptAnonOnly).await;
        let service = MailService::new(&server.client_config());
        let mut mail = mail();
        mail.set_subject("Grüße");
        mail.set_content("Schöne Grüße aus Köln");

        service.send_mail(mail).await.unwrap();

        let email = timeout("receiving mail", server.try_receive())
            .await
            .unwrap();
        assert_eq!(email.subject, "Grüße");
        assert!(email.body.contains("Schöne Grüße aus Köln"));
    }

    #[tokio::test]
    async fn send_login_ok() {
        let mut server = start_server(login()).await;
        let service = MailService::new(&server.client_config());

        assert!(service.test_connection().await.unwrap());
        service.send_mail(mail()).await.unwrap();

        assert_eq!(server.received_messages().len(), 1);
    }

    #[tokio::test]
    async fn send_login_fail() {
        let mut server = start_server(login()).await;
        let mut config = server.client_config();
        config.credentials = Some(("user".to_string(), "xxx".to_string()));
        let service = MailService::new(&config);

        match timeout("sending mail", service.send_mail(mail())).await {
            Err(MessagingError::Transport(error)) => {
                assert!(error.is_permanent())
            }
            other => panic!("expected auth fail, received: {other:?}"),
        }
        assert!(server.received_messages().is_empty());
    }

    #[tokio::test]
    async fn send_anon_to_login_server() {
        let mut server = start_server(login()).await;
        let mut config = server.client_config();
        config.credentials = None;
        let service = MailService::new(&config);

        match timeout("sending mail", service.send_mail(mail())).await {
            Err(MessagingError::Transport(error)) => {
                assert!(error.is_permanent())
            }
            other => panic!("expected auth fail, received: {other:?}"),
        }
        assert!(server.received_messages().is_empty());
    }

    #[tokio::test]
    async fn send_login_to_anon_only_server() {
        let mut server = start_server(Auth::AcceptAnonOnly).await;
        let mut config = server.client_config();
        config.credentials = Some(("user".to_string(), "pwd".to_string()));
        let service = MailService::new(&config);

        let result = timeout("sending mail", service.send_mail(mail())).await;
        assert!(matches!(result, Err(MessagingError::Transport(_))));
        assert!(server.received_messages().is_empty());
    }

    #[tokio::test]
    async fn send_empty_to() {
        let mut server = start_server(Auth::AcceptAll).await;
        let service = MailService::new(&server.client_config());
        let mut mail = mail();
        mail.set_to("");

        let result = service.send_mail(mail).await;
        assert!(matches!(result, Err(MessagingError::Address { .. })));
        assert!(server.received_messages().is_empty());
    }

    #[tokio::test]
    async fn send_malformed_to() {
        let mut server = start_server(Auth::AcceptAll).await;
        let service = MailService::new(&server.client_config());
        let mut mail = mail();
        mail.set_to("info.example.com");

        let result = service.send_mail(mail).await;
        assert!(matches!(result, Err(MessagingError::Address { .. })));
        assert!(server.received_messages().is_empty());
    }

    #[tokio::test]
    async fn send_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let service = MailService::new(&Config {
            address: "127.0.0.1".to_string(),
            port: Some(port),
            credentials: None,
        });

        let result = timeout("sending mail", service.send_mail(mail())).await;
        assert!(matches!(result, Err(MessagingError::Transport(_))));
    }
}
