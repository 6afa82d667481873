//! The pattern→action rule language the detours consult.
//!
//! A rule string is a semicolon-separated list of tokens:
//!
//! ```text
//! pattern[:port][=replacement[:port]]
//! ```
//!
//! `pattern` is either a host-name glob or a dotted-quad IPv4 address
//! with an optional `/prefix` mask. An empty `replacement` denies the
//! match, `0.0.0.0` passes it through, anything else redirects to it.
//! A bare address token with no port and no `=` is the classic short
//! form: redirect connects on the default content-server port to that
//! address.
//!
//! The live set is immutable once published; writers build a fresh set
//! and swap one `Arc`, so a detour mid-evaluation always sees a complete
//! rule set, old or new.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::error::{FilterError, Result};
use crate::glob::glob_match;

/// The classic content-server port; portless numeric shorthand rules
/// bind to it so they cannot swallow a host's ordinary HTTP traffic.
pub const STEAM_CDN_PORT: u16 = 27030;

/// Appended to every installed rule string, after the custom rules so
/// they can override it: uncustomized lookups for the content CDN family
/// are dropped.
const DNS_CATCH_ALL: &str = "content?.steampowered.com=";

/// What a matched rule says to do with the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Forward unchanged. Distinct from "no rule matched": it stops
    /// rule evaluation.
    Passthrough,
    /// Refuse the call with the appropriate sockets error.
    Deny,
    /// Redirect. `None` keeps the caller's address or port.
    Rewrite {
        addr: Option<Ipv4Addr>,
        port: Option<u16>,
    },
}

#[derive(Clone, Debug)]
enum Pattern {
    /// Host-name glob; name lookups only.
    Host(String),
    /// Address-under-mask; numeric connects only.
    Numeric { addr: u32, mask: u32 },
    /// No pattern at all (the shorthand form); matches any endpoint
    /// subject to the port constraint, never a name.
    Any,
}

/// One parsed rule token.
#[derive(Clone, Debug)]
pub struct Rule {
    pattern: Pattern,
    port: Option<u16>,
    action: Action,
}

impl Rule {
    fn matches_endpoint(&self, addr: Ipv4Addr, port: u16) -> bool {
        if self.port.is_some_and(|p| p != port) {
            return false;
        }
        match &self.pattern {
            Pattern::Numeric { addr: rule, mask } => {
                u32::from(addr) & mask == rule & mask
            }
            Pattern::Any => true,
            Pattern::Host(_) => false,
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        match &self.pattern {
            Pattern::Host(pattern) => glob_match(pattern, name),
            _ => false,
        }
    }
}

/// An ordered rule list; first match wins.
#[derive(Clone, Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
    default_port: u16,
}

impl RuleSet {
    pub fn new(default_port: u16) -> Self {
        Self {
            rules: Vec::new(),
            default_port,
        }
    }

    /// Parse a whole rule string into a fresh set. The empty string is a
    /// valid set that matches nothing.
    pub fn parse(text: &str, default_port: u16) -> Result<Self> {
        let mut set = Self::new(default_port);
        set.append_str(text)?;
        Ok(set)
    }

    /// Parse `text` and add its rules after the existing ones.
    pub fn append_str(&mut self, text: &str) -> Result<()> {
        let mut parsed = Vec::new();
        for token in text.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            parsed.push(parse_token(token, self.default_port)?);
        }
        self.rules.extend(parsed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Decision for a connect-time destination, or `None` if no rule
    /// matched.
    pub fn match_endpoint(&self, addr: Ipv4Addr, port: u16) -> Option<Action> {
        self.rules
            .iter()
            .find(|rule| rule.matches_endpoint(addr, port))
            .map(|rule| rule.action)
    }

    /// Decision for a DNS-style lookup by host name.
    pub fn match_name(&self, name: &str) -> Option<Action> {
        self.rules
            .iter()
            .find(|rule| rule.matches_name(name))
            .map(|rule| rule.action)
    }
}

/// Parse `address[:port]`, where a zero or absent port means
/// unconstrained.
fn parse_endpoint(text: &str) -> Result<(Ipv4Addr, Option<u16>)> {
    let (addr_text, port) = split_port(text)?;
    let addr = addr_text
        .parse::<Ipv4Addr>()
        .map_err(|_| FilterError::BadRule(text.to_string()))?;
    Ok((addr, port))
}

fn split_port(text: &str) -> Result<(&str, Option<u16>)> {
    match text.split_once(':') {
        None => Ok((text, None)),
        Some((head, port_text)) => {
            let port = port_text
                .parse::<u16>()
                .map_err(|_| FilterError::BadRule(text.to_string()))?;
            Ok((head, if port == 0 { None } else { Some(port) }))
        }
    }
}

/// Parse `addr[/prefix]` into an address-under-mask pair, host order.
fn parse_masked(text: &str) -> Option<(u32, u32)> {
    let (addr_text, mask) = match text.split_once('/') {
        None => (text, u32::MAX),
        Some((addr_text, prefix_text)) => {
            let prefix = prefix_text.parse::<u32>().ok()?;
            if prefix > 32 {
                return None;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix)
            };
            (addr_text, mask)
        }
    };
    let addr = addr_text.parse::<Ipv4Addr>().ok()?;
    Some((u32::from(addr), mask))
}

fn parse_token(token: &str, default_port: u16) -> Result<Rule> {
    let (match_text, replacement) = match token.split_once('=') {
        Some((lhs, rhs)) => (lhs.trim(), Some(rhs.trim())),
        None => (token, None),
    };

    // The classic short form: a bare address is a replacement for the
    // default content-server port, not a pattern.
    if replacement.is_none() && !match_text.contains(':') {
        if let Ok(addr) = match_text.parse::<Ipv4Addr>() {
            return Ok(Rule {
                pattern: Pattern::Any,
                port: Some(default_port),
                action: Action::Rewrite {
                    addr: Some(addr),
                    port: None,
                },
            });
        }
    }

    let (pattern_text, port) = split_port(match_text)?;
    let pattern = if pattern_text.is_empty() {
        Pattern::Any
    } else if let Some((addr, mask)) = parse_masked(pattern_text) {
        Pattern::Numeric { addr, mask }
    } else if pattern_text.contains('/') {
        // A slash only belongs in a numeric pattern; a glob with one is
        // a typo, not a host name.
        return Err(FilterError::BadRule(token.to_string()));
    } else {
        Pattern::Host(pattern_text.to_string())
    };

    let action = match replacement {
        // No replacement side at all: drop whatever the pattern catches.
        None | Some("") => Action::Deny,
        Some(text) => {
            let (addr, port) = parse_endpoint(text)?;
            if addr == Ipv4Addr::BROADCAST {
                Action::Deny
            } else if addr.is_unspecified() && port.is_none() {
                Action::Passthrough
            } else {
                Action::Rewrite {
                    addr: (!addr.is_unspecified()).then_some(addr),
                    port,
                }
            }
        }
    };

    Ok(Rule {
        pattern,
        port,
        action,
    })
}

static ACTIVE: Lazy<Mutex<Arc<RuleSet>>> =
    Lazy::new(|| Mutex::new(Arc::new(RuleSet::new(STEAM_CDN_PORT))));

/// The rule set in force right now. Cheap; detours call this on every
/// intercepted call.
pub fn active() -> Arc<RuleSet> {
    ACTIVE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn publish(set: RuleSet) {
    *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(set);
}

/// Replace the live rules with those parsed from `text`, plus the
/// built-in DNS catch-all (appended last, so custom rules win). A parse
/// error leaves the prior rules in force.
pub fn install(text: &str) -> Result<()> {
    let mut set = RuleSet::parse(text, STEAM_CDN_PORT)?;
    set.append_str(DNS_CATCH_ALL)?;
    publish(set);
    Ok(())
}

/// Add rules to the live set without replacing it.
pub fn append(text: &str) -> Result<()> {
    let mut set = (*active()).clone();
    set.append_str(text)?;
    publish(set);
    Ok(())
}
