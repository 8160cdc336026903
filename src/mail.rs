use lettre::{
    message::{header, Mailbox, SinglePart},
    Message,
};

use crate::MessagingError;

/// A single outgoing plain-text email.
///
/// The addresses are not checked here;
/// that happens when the mail is sent.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Mail {
    /// The sender, either `user@domain` or `Name <user@domain>`.
    pub from: String,
    /// The single recipient, in the same format as `from`.
    pub to: String,
    pub subject: String,
    /// The plain-text body.
    pub content: String,
}

impl Mail {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            content: content.into(),
        }
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn set_from(&mut self, from: impl Into<String>) {
        self.from = from.into();
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn set_to(&mut self, to: impl Into<String>) {
        self.to = to.into();
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.subject = subject.into();
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
    }

    /// Compose the MIME message for this mail,
    /// with a single `text/plain` part.
    pub(crate) fn to_message(&self) -> Result<Message, MessagingError> {
        Ok(Message::builder()
            .from(parse_mailbox(&self.from)?)
            .to(parse_mailbox(&self.to)?)
            .subject(self.subject.as_str())
            .singlepart(
                SinglePart::builder()
                    .header(header::ContentType::TEXT_PLAIN)
                    .body(self.content.clone()),
            )?)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MessagingError> {
    address
        .parse()
        .map_err(|source| MessagingError::Address {
            address: address.to_string(),
            source,
        })
}
