use std::collections::HashMap;

/// A parsed email as received by the test server.
#[derive(Debug)]
#[non_exhaustive]
pub struct ReceivedMail {
    /// The email address of the sender.
    ///
    /// This is the address as received in the SMTP exchange
    /// and does not include a name.
    pub address_from: String,

    /// The email addresses of the recipients,
    /// in the order they were given in the SMTP exchange.
    pub addresses_to: Vec<String>,

    /// The subject of this email,
    /// taken from the headers.
    pub subject: String,

    /// The map of headers.
    pub headers: HashMap<String, String>,

    /// The decoded text part of this email.
    pub body: String,
}

impl ReceivedMail {
    pub(crate) fn parse(data: crate::smtp::Data) -> Result<Self, ParseError> {
        let mail = mailparse::parse_mail(&data.email)?;
        convert_email(data.address_from, data.addresses_to, mail)
    }

    /// The first recipient address.
    pub fn recipient(&self) -> Option<&str> {
        self.addresses_to.first().map(String::as_str)
    }

    /// Get the complete `From` header
    /// which includes the name and email address.
    pub fn get_from(&self) -> Option<&str> {
        self.headers.get("From").map(String::as_str)
    }

    /// Get the complete `To` header
    /// which includes the names and email addresses.
    pub fn get_to(&self) -> Option<&str> {
        self.headers.get("To").map(String::as_str)
    }
}

/// An error during email parsing.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Parse(#[from] mailparse::MailParseError),
    #[error(transparent)]
    Convert(#[from] ConversionError),
}

/// An error during conversion from
/// [`mailparse::ParsedMail`]
/// into [`ReceivedMail`].
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("missing `From` address")]
    MisingFromAddress,
    #[error("multiple `From` addresses")]
    MultipleFromAddresses(Vec<String>),
    #[error("mismatch `From` address; smtp: {smtp}, email: {email}")]
    FromAddressMismatch { smtp: String, email: String },
    #[error("recipient {smtp} missing from `To` and `Cc`: {email:?}")]
    RecipientMismatch { smtp: String, email: Vec<String> },
    #[error("missing `Subject` header")]
    MisingSubject,
    #[error("multiple `Subject` headers")]
    MultipleSubjects(Vec<String>),
    #[error(
        "unexpected part mimetype; expected {expected:?}, received {actual:?}"
    )]
    UnexpectedPartMime {
        actual: String,
        expected: &'static str,
    },
}

const TEXT_PLAIN: &str = "text/plain";

/// Convert a [`mailparse::ParsedMail`] into a [`ReceivedMail`].
fn convert_email(
    address_from: String,
    addresses_to: Vec<String>,
    mail: mailparse::ParsedMail,
) -> Result<ReceivedMail, ParseError> {
    use mailparse::MailHeaderMap;
    let mut from_addrs = header_addresses(&mail.headers, "From")?;
    let from_addr = if from_addrs.len() > 1 {
        return Err(ConversionError::MultipleFromAddresses(from_addrs).into());
    } else {
        from_addrs.pop().ok_or(ConversionError::MisingFromAddress)?
    };
    // an empty reverse path is a bounce and names nobody
    if !address_from.is_empty() && !from_addr.eq_ignore_ascii_case(&address_from)
    {
        return Err(ConversionError::FromAddressMismatch {
            smtp: address_from,
            email: from_addr,
        }
        .into());
    }
    let mut to_addrs = header_addresses(&mail.headers, "To")?;
    to_addrs.extend(header_addresses(&mail.headers, "Cc")?);
    if let Some(missing) = addresses_to.iter().find(|address| {
        !to_addrs.iter().any(|to| to.eq_ignore_ascii_case(address))
    }) {
        return Err(ConversionError::RecipientMismatch {
            smtp: missing.clone(),
            email: to_addrs,
        }
        .into());
    }
    let mut subjects = mail.headers.get_all_values("Subject");
    let subject = if subjects.len() > 1 {
        return Err(ConversionError::MultipleSubjects(subjects).into());
    } else {
        let subject = subjects.pop().ok_or(ConversionError::MisingSubject)?;
        subject
            .strip_suffix("\r\n")
            .map(|s| s.to_string())
            .unwrap_or(subject)
    };
    let body = match find_text_part(&mail) {
        Some(part) => part.get_body()?,
        None => {
            return Err(ConversionError::UnexpectedPartMime {
                actual: mail.ctype.mimetype.clone(),
                expected: TEXT_PLAIN,
            }
            .into())
        }
    };
    Ok(ReceivedMail {
        address_from,
        addresses_to,
        subject,
        headers: mail
            .headers
            .iter()
            .map(|header| (header.get_key(), header.get_value()))
            .collect(),
        body,
    })
}

/// The bare addresses in all `key` headers,
/// including the members of groups.
fn header_addresses(
    headers: &[mailparse::MailHeader],
    key: &str,
) -> Result<Vec<String>, mailparse::MailParseError> {
    use mailparse::{MailAddr, MailHeaderMap};
    let mut addresses = Vec::new();
    for header in headers.get_all_headers(key) {
        for address in mailparse::addrparse_header(header)?.iter() {
            match address {
                MailAddr::Single(info) => addresses.push(info.addr.clone()),
                MailAddr::Group(group) => addresses
                    .extend(group.addrs.iter().map(|info| info.addr.clone())),
            }
        }
    }
    Ok(addresses)
}

/// The mail itself if it is plain text,
/// otherwise its first plain text part.
fn find_text_part<'a, 'b>(
    mail: &'b mailparse::ParsedMail<'a>,
) -> Option<&'b mailparse::ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        (mail.ctype.mimetype == TEXT_PLAIN).then_some(mail)
    } else {
        mail.subparts.iter().find_map(find_text_part)
    }
}
