//! This crate sends plain-text email over SMTP with a [`MailService`]
//! and provides a simple SMTP [`Server`] that can be used in tests
//! to check the email sent.
//!
//! A [`Mail`] holds the sender, the single recipient,
//! the subject and the body. [`MailService::send_mail`]
//! opens a connection to the configured server,
//! transmits the mail and returns any failure as a [`MessagingError`].
//!
//! The server is only available with the `test-server` feature,
//! which is enabled by default.
//!
//! # Examples
//!
//! ```
//! # tokio_test::block_on(async {
//! use mail_service::{Auth, Mail, MailService, Server};
//!
//! let mut server = Server::start(
//!     "127.0.0.1:0".parse().unwrap(),
//!     Auth::Login {
//!         username: "my-name".to_string(),
//!         password: "secret".to_string(),
//!     },
//! ).await.unwrap();
//!
//! // the client configuration carries the server's address and login
//! let service = MailService::new(&server.client_config());
//!
//! let mail = Mail::new(
//!     "no-reply@example.com",
//!     "info@example.com",
//!     "Test",
//!     "Hello",
//! );
//! service.send_mail(mail).await.unwrap();
//!
//! let email = server.try_receive().await.unwrap();
//! assert_eq!(email.subject, "Test");
//! assert_eq!(email.recipient(), Some("info@example.com"));
//! assert!(email.body.contains("Hello"));
//! # })
//! ```
//!
//! Outside of tests the service is usually configured
//! from the environment:
//!
//! ```no_run
//! # async fn send() -> Result<(), Box<dyn std::error::Error>> {
//! use mail_service::{Mail, MailService};
//!
//! // SMTP_URL=user:password@smtp.example.com:587
//! let service = MailService::from_env()?;
//! service
//!     .send_mail(Mail::new(
//!         "no-reply@example.com",
//!         "info@example.com",
//!         "Test",
//!         "Hello",
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod config;
mod mail;
mod service;

#[cfg(feature = "test-server")]
mod received;
#[cfg(feature = "test-server")]
mod server;
#[cfg(feature = "test-server")]
mod smtp;

pub use config::{Config, ConfigError, DEFAULT_PORT};
pub use mail::Mail;
pub use service::{MailService, MessagingError};

#[cfg(feature = "test-server")]
pub use received::{ConversionError, ParseError, ReceivedMail};
#[cfg(feature = "test-server")]
pub use server::{Error, Server};
#[cfg(feature = "test-server")]
pub use smtp::{Auth, Error as SmtpError};
