//! Route file parsing.
//!
//! A route file holds one forwarding rule per line:
//!
//! ```text
//! # comment
//! web=8080->10.0.0.5:80
//! db=5432->[fd00::12]:5432
//! ```
//!
//! Invalid lines never abort loading. They are reported as [`Diagnostic`]s
//! and excluded from the resulting [`RouteTable`].

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};

/// A validated forwarding rule: one local port relayed to one fixed remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    /// Free-form name from the left side of `=`.
    pub alias: String,
    /// Port the relay listens on.
    pub local_port: u16,
    /// Host every accepted connection is forwarded to.
    pub remote_host: String,
    /// Port on the remote host.
    pub remote_port: u16,
}

impl RouteDescriptor {
    /// Address to bind the local listener on.
    pub fn local_addr(&self, host: IpAddr) -> SocketAddr {
        SocketAddr::new(host, self.local_port)
    }

    /// Resolve the remote endpoint, taking the first address returned.
    pub fn resolve_remote(&self) -> Result<SocketAddr> {
        let target = (self.remote_host.as_str(), self.remote_port);
        target
            .to_socket_addrs()
            .map_err(|e| Error::AddressResolution(format!("{}: {}", self, e)))?
            .next()
            .ok_or_else(|| Error::AddressResolution(format!("{}: no addresses", self)))
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remote_host.contains(':') {
            write!(
                f,
                "{}->[{}]:{}",
                self.local_port, self.remote_host, self.remote_port
            )
        } else {
            write!(
                f,
                "{}->{}:{}",
                self.local_port, self.remote_host, self.remote_port
            )
        }
    }
}

/// Why a route line was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LineProblem {
    /// No `=` between the alias and the rest of the line.
    #[error("line not in format alias=localPort->remoteHost:remotePort")]
    MissingEquals,

    /// No `->` between the local port and the remote address.
    #[error("line doesn't contain -> splitter")]
    MissingArrow,

    /// The remote address has no `:port` suffix.
    #[error("remote should be in form remoteHost:remotePort")]
    MissingRemotePort,

    /// A port field that is not an integer.
    #[error("couldn't parse {0:?} as port")]
    InvalidPort(String),

    /// A port that parsed but is not in `1..=65535`.
    #[error("port {0} is outside 1..=65535")]
    PortOutOfRange(i64),

    /// Nothing before the `:` of the remote address.
    #[error("remote host is empty")]
    EmptyRemoteHost,

    /// A local port already claimed by an earlier line.
    #[error("local port {0} is already routed by an earlier line")]
    DuplicateLocalPort(u16),
}

/// A rejected line, with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Position of the line in the file, starting at 1.
    pub line_number: usize,
    /// The rejected line, as read.
    pub line: String,
    /// What was wrong with it.
    pub problem: LineProblem,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.line_number, self.problem, self.line)
    }
}

/// Parse a single route line.
///
/// Returns `Ok(None)` for comments and blank lines.
pub fn parse_line(line: &str) -> std::result::Result<Option<RouteDescriptor>, LineProblem> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let (alias, rule) = trimmed.split_once('=').ok_or(LineProblem::MissingEquals)?;
    let (local, remote) = rule.split_once("->").ok_or(LineProblem::MissingArrow)?;

    let local_port = parse_port(local)?;

    let (host, port) = remote
        .trim()
        .rsplit_once(':')
        .ok_or(LineProblem::MissingRemotePort)?;
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(LineProblem::EmptyRemoteHost);
    }
    let remote_port = parse_port(port)?;

    Ok(Some(RouteDescriptor {
        alias: alias.trim().to_string(),
        local_port,
        remote_host: host.to_string(),
        remote_port,
    }))
}

fn parse_port(s: &str) -> std::result::Result<u16, LineProblem> {
    let s = s.trim();
    let value: i64 = s
        .parse()
        .map_err(|_| LineProblem::InvalidPort(s.to_string()))?;
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(LineProblem::PortOutOfRange(value)),
    }
}

/// Validated routes plus the diagnostics of every rejected line.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteDescriptor>,
    diagnostics: Vec<Diagnostic>,
}

impl RouteTable {
    /// Parse a whole route file body.
    pub fn parse(content: &str) -> Self {
        let mut table = Self::default();
        let mut claimed = HashSet::new();

        for (index, line) in content.lines().enumerate() {
            let outcome = parse_line(line).and_then(|route| match route {
                Some(route) if !claimed.insert(route.local_port) => {
                    Err(LineProblem::DuplicateLocalPort(route.local_port))
                }
                other => Ok(other),
            });

            match outcome {
                Ok(Some(route)) => {
                    debug!("Route {} ({})", route, route.alias);
                    table.routes.push(route);
                }
                Ok(None) => {}
                Err(problem) => table.diagnostics.push(Diagnostic {
                    line_number: index + 1,
                    line: line.to_string(),
                    problem,
                }),
            }
        }

        table
    }

    /// Read and parse a route file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no line produced a usable route.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn route(line: &str) -> RouteDescriptor {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn parse_full_line() {
        let r = route("web=8080->10.0.0.5:80");
        assert_eq!(r.alias, "web");
        assert_eq!(r.local_port, 8080);
        assert_eq!(r.remote_host, "10.0.0.5");
        assert_eq!(r.remote_port, 80);
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let r = route("  db = 5432 -> db.internal : 5432  ");
        assert_eq!(r.alias, "db");
        assert_eq!(r.local_port, 5432);
        assert_eq!(r.remote_host, "db.internal");
        assert_eq!(r.remote_port, 5432);
    }

    #[test]
    fn parse_bracketed_ipv6_remote() {
        let r = route("v6=9000->[::1]:9100");
        assert_eq!(r.remote_host, "::1");
        assert_eq!(r.remote_port, 9100);
        assert_eq!(r.to_string(), "9000->[::1]:9100");
    }

    #[test]
    fn empty_alias_is_allowed() {
        let r = route("=9000->127.0.0.1:9100");
        assert_eq!(r.alias, "");
        assert_eq!(r.to_string(), "9000->127.0.0.1:9100");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert_eq!(parse_line("# web=8080->10.0.0.5:80"), Ok(None));
        assert_eq!(parse_line("#"), Ok(None));
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   \t"), Ok(None));
    }

    #[test]
    fn port_bounds() {
        assert_eq!(route("a=1->h:65535").local_port, 1);
        assert_eq!(route("a=1->h:65535").remote_port, 65535);
        assert_eq!(parse_line("a=0->h:80"), Err(LineProblem::PortOutOfRange(0)));
        assert_eq!(
            parse_line("a=80->h:65536"),
            Err(LineProblem::PortOutOfRange(65536))
        );
        assert_eq!(
            parse_line("a=-5->h:80"),
            Err(LineProblem::PortOutOfRange(-5))
        );
    }

    #[test]
    fn structural_problems() {
        assert_eq!(parse_line("8080->h:80"), Err(LineProblem::MissingEquals));
        assert_eq!(parse_line("a=8080 h:80"), Err(LineProblem::MissingArrow));
        assert_eq!(parse_line("a=8080->h"), Err(LineProblem::MissingRemotePort));
        assert_eq!(parse_line("a=8080->:80"), Err(LineProblem::EmptyRemoteHost));
        assert_eq!(
            parse_line("a=http->h:80"),
            Err(LineProblem::InvalidPort("http".into()))
        );
        assert_eq!(
            parse_line("a=80->h:"),
            Err(LineProblem::InvalidPort(String::new()))
        );
    }

    #[test]
    fn table_collects_routes_and_diagnostics() {
        let table = RouteTable::parse(
            "# routes\n\
             web=8080->10.0.0.5:80\n\
             broken=8081\n\
             \n\
             api=8082->api.internal:443\n\
             bad=99999->h:1\n",
        );

        assert_eq!(table.len(), 2);
        assert_eq!(table.routes()[0].local_port, 8080);
        assert_eq!(table.routes()[1].local_port, 8082);

        let lines: Vec<usize> = table.diagnostics().iter().map(|d| d.line_number).collect();
        assert_eq!(lines, vec![3, 6]);
        assert_eq!(table.diagnostics()[0].problem, LineProblem::MissingArrow);
    }

    #[test]
    fn duplicate_local_port_keeps_first() {
        let table = RouteTable::parse("a=9000->h1:1\nb=9000->h2:2\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes()[0].remote_host, "h1");
        assert_eq!(
            table.diagnostics()[0].problem,
            LineProblem::DuplicateLocalPort(9000)
        );
    }

    #[test]
    fn invalid_line_does_not_claim_port() {
        let table = RouteTable::parse("a=9000->h1\nb=9000->h2:2\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes()[0].remote_host, "h2");
        assert_eq!(table.diagnostics().len(), 1);
    }

    #[test]
    fn diagnostic_display_names_line() {
        let table = RouteTable::parse("\nbroken\n");
        assert_eq!(
            table.diagnostics()[0].to_string(),
            "2: line not in format alias=localPort->remoteHost:remotePort: broken"
        );
    }

    #[test]
    fn local_and_remote_addresses() {
        let r = route("echo=9000->127.0.0.1:9100");
        assert_eq!(
            r.local_addr(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            r.resolve_remote().unwrap(),
            "127.0.0.1:9100".parse::<SocketAddr>().unwrap()
        );
    }
}
