// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `nxtcp://host:port` parsing.

use url::Url;

use crate::Error;

/// The only transport scheme this crate speaks.
pub const SCHEME: &str = "nxtcp";

/// Parses a channel URI down to the `host:port` the connection dials.
pub fn parse(uri: &str) -> Result<String, Error> {
    let parsed = Url::parse(uri).map_err(|err| Error::InvalidUri {
        uri: uri.to_owned(),
        reason: err.to_string(),
    })?;

    if parsed.scheme() != SCHEME {
        return Err(Error::UnknownProtocol(parsed.scheme().to_owned()));
    }

    let host = match parsed.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => {
            return Err(Error::InvalidUri {
                uri: uri.to_owned(),
                reason: "missing host".to_owned(),
            });
        },
    };

    let port = parsed.port().ok_or_else(|| Error::InvalidUri {
        uri: uri.to_owned(),
        reason: "missing port".to_owned(),
    })?;

    Ok(format!("{host}:{port}"))
}
