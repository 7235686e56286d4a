//! SMTP adapter (mail notifications).
//!
//! Implicit TLS on the configured port (465 by default); `587` switches to
//! STARTTLS.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use wxrelay_core::{config::MailConfig, errors::Error, ports::Notifier, Result};

const STARTTLS_PORT: u16 = 587;

pub struct SmtpNotifier {
    from: Mailbox,
    to: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    /// Validate both mailboxes and build the relay transport.
    ///
    /// Invalid addresses are a config error so startup can fail fast.
    pub fn new(cfg: &MailConfig) -> Result<Self> {
        let from = mailbox(&cfg.from_name, &cfg.from_address, "FROM_ADDRESS")?;
        let to = mailbox(&cfg.to_name, &cfg.to_address, "TO_ADDRESS")?;

        let builder = if cfg.smtp_port == STARTTLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_server)
        }
        .map_err(|e| Error::Config(format!("SMTP_SERVER {}: {e}", cfg.smtp_server)))?;

        let transport = builder
            .port(cfg.smtp_port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();

        tracing::info!(
            server = %cfg.smtp_server,
            port = cfg.smtp_port,
            to = %to,
            "smtp notifier ready"
        );
        Ok(Self { from, to, transport })
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| Error::External(format!("smtp message build error: {e}")))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let message = self.build_message(subject, body)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| Error::External(format!("smtp send error: {e}")))?;
        Ok(())
    }
}

fn mailbox(name: &str, address: &str, key: &str) -> Result<Mailbox> {
    let address: Address = address
        .parse()
        .map_err(|e| Error::Config(format!("{key} {address:?} is not a valid address: {e}")))?;
    let name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
    Ok(Mailbox::new(name, address))
}
