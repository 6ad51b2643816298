//! AMQP (RabbitMQ) transport.
//!
//! Connects to the address resolved at configuration time, never to the
//! hostname from the DSN. Over TLS the certificate is still checked against
//! the DSN hostname, unless verification is switched off.

use std::net::SocketAddr;

use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    tcp::{HandshakeError, TcpStream},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use native_tls::{Certificate, TlsConnector};
use tracing::{debug, warn};

use super::{BrokerError, Connector, Delivery, Result, Session, CONTENT_TYPE, PERSISTENT};
use crate::config::ConnectionParams;

/// Name the connection shows up under in the broker's management UI.
const CONNECTION_NAME: &str = "transfer-audit";
/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Rebuild the connection URI around the literal broker address.
pub fn uri_for(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        scheme: if params.ssl {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.username.clone(),
                password: params.password.clone(),
            },
            host: params.ip.to_string(),
            port: params.port,
        },
        vhost: params.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            ..Default::default()
        },
    }
}

/// How the broker's certificate is checked during the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Name the certificate must match: the host as written in the DSN,
    /// not the address the socket connects to.
    pub domain: String,
    pub accept_invalid_certs: bool,
    pub accept_invalid_hostnames: bool,
    /// PEM CA certificate added to the trust roots.
    pub root_pem: Option<Vec<u8>>,
}

impl TlsOptions {
    /// Read the verification switches and the CA file from `params`.
    pub async fn load(params: &ConnectionParams) -> Result<Self> {
        let root_pem = match &params.cacert {
            Some(path) => {
                debug!(cacert = %path.display(), "Loading CA certificate");
                let pem = tokio::fs::read(path).await.map_err(|e| {
                    BrokerError::Tls(format!(
                        "Cannot read CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(pem)
            }
            None => None,
        };

        if !params.verify_peer {
            warn!(host = %params.host, "Broker certificate will not be verified");
        } else if !params.verify_hostname {
            warn!(host = %params.host, "Broker certificate hostname will not be verified");
        }

        Ok(Self {
            domain: params.host.clone(),
            accept_invalid_certs: !params.verify_peer,
            accept_invalid_hostnames: !params.verify_hostname,
            root_pem,
        })
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        builder
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.accept_invalid_hostnames);

        if let Some(pem) = &self.root_pem {
            let root = Certificate::from_pem(pem)
                .map_err(|e| BrokerError::Tls(format!("Invalid CA certificate: {}", e)))?;
            builder.add_root_certificate(root);
        }

        builder
            .build()
            .map_err(|e| BrokerError::Tls(format!("Cannot build TLS connector: {}", e)))
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Session>> {
        let uri = uri_for(params);
        let properties =
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into());

        let connection = if params.ssl {
            let tls = TlsOptions::load(params).await?;
            let connector = tls.connector()?;
            let addr = SocketAddr::new(params.ip, params.port);
            let domain = tls.domain;
            Connection::connector(
                uri,
                Box::new(move |_uri: &AMQPUri| {
                    TcpStream::connect(addr)
                        .map_err(HandshakeError::Failure)?
                        .into_native_tls(&connector, &domain)
                }),
                properties,
            )
            .await
        } else {
            Connection::connect_uri(uri, properties).await
        }
        .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel failed").await;
                return Err(BrokerError::Channel(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        Ok(Box::new(AmqpSession {
            connection,
            channel,
        }))
    }
}

/// One lapin connection with its publishing channel.
struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Session for AmqpSession {
    async fn publish(&mut self, delivery: &Delivery<'_>) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_correlation_id(delivery.correlation_id.into());

        self.channel
            .basic_publish(
                delivery.exchange,
                delivery.routing_key,
                BasicPublishOptions::default(),
                delivery.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            correlation_id = %delivery.correlation_id,
            "Published audit record"
        );
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let channel_result = self.channel.close(REPLY_SUCCESS, "closing").await;
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to close connection: {}", e)))?;
        channel_result
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_uri_uses_resolved_address() {
        let params = ConnectionParams {
            host: "mq.example.org".to_string(),
            ip: IpAddr::from([10, 0, 0, 7]),
            port: 5671,
            vhost: "lega".to_string(),
            heartbeat: 30,
            ssl: true,
            ..ConnectionParams::for_test()
        };

        let uri = uri_for(&params);

        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "10.0.0.7");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "lega");
        assert_eq!(uri.query.heartbeat, Some(30));
    }

    #[test]
    fn test_plain_scheme_without_tls() {
        let uri = uri_for(&ConnectionParams::for_test());
        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.vhost, "/");
    }

    #[tokio::test]
    async fn test_missing_cacert_is_tls_error() {
        let params = ConnectionParams {
            ssl: true,
            cacert: Some("/nonexistent/ca.pem".into()),
            ..ConnectionParams::for_test()
        };
        assert!(matches!(
            TlsOptions::load(&params).await,
            Err(BrokerError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_options_verify_by_default() {
        let params = ConnectionParams {
            host: "mq.example.org".to_string(),
            ip: IpAddr::from([10, 0, 0, 7]),
            ssl: true,
            ..ConnectionParams::for_test()
        };

        let tls = TlsOptions::load(&params).await.unwrap();

        assert_eq!(tls.domain, "mq.example.org");
        assert!(!tls.accept_invalid_certs);
        assert!(!tls.accept_invalid_hostnames);
        assert!(tls.root_pem.is_none());
        assert!(tls.connector().is_ok());
    }

    #[tokio::test]
    async fn test_tls_options_honour_disabled_verification() {
        let params = ConnectionParams {
            ssl: true,
            verify_peer: false,
            verify_hostname: false,
            ..ConnectionParams::for_test()
        };

        let tls = TlsOptions::load(&params).await.unwrap();

        assert!(tls.accept_invalid_certs);
        assert!(tls.accept_invalid_hostnames);
        assert!(tls.connector().is_ok());
    }

    #[tokio::test]
    async fn test_hostname_check_can_be_disabled_alone() {
        let params = ConnectionParams {
            ssl: true,
            verify_hostname: false,
            ..ConnectionParams::for_test()
        };

        let tls = TlsOptions::load(&params).await.unwrap();

        assert!(!tls.accept_invalid_certs);
        assert!(tls.accept_invalid_hostnames);
    }

    #[tokio::test]
    async fn test_garbage_cacert_is_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, b"not a certificate").unwrap();
        let params = ConnectionParams {
            ssl: true,
            cacert: Some(path),
            ..ConnectionParams::for_test()
        };

        let tls = TlsOptions::load(&params).await.unwrap();
        assert_eq!(tls.root_pem.as_deref(), Some(&b"not a certificate"[..]));
        assert!(matches!(tls.connector(), Err(BrokerError::Tls(_))));
    }
}
