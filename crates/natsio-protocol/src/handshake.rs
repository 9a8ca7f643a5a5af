//! Handshake decisions taken between the server's `INFO` and the client's
//! `CONNECT`. The client performs the I/O; this module decides.

use crate::auth::Authenticator;
use crate::error::{NatsError, Result};
use crate::info::{ConnectInfo, ServerInfo, LANG};
use crate::options::ConnectOptions;
use crate::server_pool::Server;

pub const PROTOCOL_VERSION: i32 = 1;

/// Validates `INFO` against the client's options. Returns whether the
/// transport must be upgraded to TLS before `CONNECT`.
pub fn check_server_info(
    info: &ServerInfo,
    tls_requested: bool,
    no_echo: bool,
    auth: &dyn Authenticator,
) -> Result<bool> {
    if info.tls_required && !tls_requested {
        return Err(NatsError::SecureConnRequired);
    }
    if tls_requested && !info.tls_required && !info.tls_available {
        return Err(NatsError::NonSecureConnRequired);
    }
    if no_echo && !info.supports_no_echo() {
        return Err(NatsError::NoEchoNotSupported);
    }
    if info.auth_required && info.nonce.is_some() && auth.method() == "none" {
        return Err(NatsError::NonceSignerRequired);
    }
    Ok(tls_requested)
}

/// Builds the `CONNECT` body. Credentials embedded in the server url are
/// used only when no credential variant is configured.
pub fn build_connect(
    options: &ConnectOptions,
    info: &ServerInfo,
    auth: &dyn Authenticator,
    server: &Server,
    tls: bool,
) -> Result<ConnectInfo> {
    let mut connect = ConnectInfo {
        verbose: options.verbose,
        pedantic: options.pedantic,
        protocol: PROTOCOL_VERSION,
        version: env!("CARGO_PKG_VERSION").to_string(),
        lang: LANG.to_string(),
        name: options.name.clone(),
        echo: options.no_echo.then_some(false),
        tls_required: tls,
        ..Default::default()
    };
    auth.apply(info, &mut connect)?;

    if auth.method() == "none" {
        match server.user_info() {
            Some((user, Some(pass))) => {
                connect.user = Some(user);
                connect.pass = Some(pass);
            }
            Some((token, None)) => connect.auth_token = Some(token),
            None => {}
        }
    }
    Ok(connect)
}
