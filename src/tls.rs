use std::io;

use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};

use crate::config::{CertReqs, TlsConfig};
use crate::error::{Error, Result};

/// Builds the shared TLS acceptor for an `https` listener. Certificate
/// problems surface here, at bind time, not per connection.
pub fn build_acceptor(config: &TlsConfig) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(|err| Error::Bind(io::Error::other(err)))?;

    builder
        .set_certificate_chain_file(&config.certfile)
        .map_err(|err| Error::Bind(io::Error::other(err)))?;
    builder
        .set_private_key_file(&config.keyfile, SslFiletype::PEM)
        .map_err(|err| Error::Bind(io::Error::other(err)))?;
    builder
        .check_private_key()
        .map_err(|err| Error::Bind(io::Error::other(err)))?;

    if let Some(ca_certs) = &config.ca_certs {
        builder
            .set_ca_file(ca_certs)
            .map_err(|err| Error::Bind(io::Error::other(err)))?;
    }

    let mode = match config.cert_reqs {
        CertReqs::None => SslVerifyMode::NONE,
        CertReqs::Optional => SslVerifyMode::PEER,
        CertReqs::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
    };
    builder.set_verify(mode);

    Ok(builder.build())
}
