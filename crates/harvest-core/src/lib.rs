//! Core domain model for the ticket harvester: sessions, page states, tickets and
//! ingestion records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Browser cookie as captured from (and re-applied to) an authenticated context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }
}

/// Authenticated cookie set. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub cookies: Vec<Cookie>,
    pub captured_at: DateTime<Utc>,
    pub domain: String,
}

impl Session {
    pub fn capture(domain: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            cookies,
            captured_at: Utc::now(),
            domain: domain.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Renders the cookie set as a single `Cookie:` request header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Where the login flow currently is, recomputed from live page content on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    NeedsPrimaryIdentifier,
    NeedsFederatedEmail,
    NeedsPassword,
    NeedsSecondFactor,
    NeedsCertificateAck,
    Authenticated,
    Unrecognized,
}

/// Tie-break order when a page matches more than one predicate. `Unrecognized` is the
/// fallback when nothing matches and is therefore not listed.
pub const PAGE_STATE_PRECEDENCE: [PageState; 6] = [
    PageState::NeedsCertificateAck,
    PageState::NeedsPrimaryIdentifier,
    PageState::NeedsFederatedEmail,
    PageState::NeedsPassword,
    PageState::NeedsSecondFactor,
    PageState::Authenticated,
];

impl PageState {
    pub fn as_str(self) -> &'static str {
        match self {
            PageState::NeedsPrimaryIdentifier => "needs_primary_identifier",
            PageState::NeedsFederatedEmail => "needs_federated_email",
            PageState::NeedsPassword => "needs_password",
            PageState::NeedsSecondFactor => "needs_second_factor",
            PageState::NeedsCertificateAck => "needs_certificate_ack",
            PageState::Authenticated => "authenticated",
            PageState::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true for keys shaped like `ABC-123`.
pub fn is_ticket_key(candidate: &str) -> bool {
    let Some((prefix, number)) = candidate.split_once('-') else {
        return false;
    };
    !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_uppercase())
        && !number.is_empty()
        && number.chars().all(|c| c.is_ascii_digit())
}

/// Project part of a ticket key (`ABC-123` -> `ABC`).
pub fn project_of(key: &str) -> &str {
    key.split_once('-').map(|(p, _)| p).unwrap_or(key)
}

/// One extracted work item. Identity is `key`; all other fields are descriptive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ticket {
    pub key: String,
    pub project: String,
    pub summary: String,
    pub status: String,
    pub assignee: String,
    pub reporter: String,
    pub created: String,
    pub updated: String,
    pub priority: String,
    pub description: String,
}

impl Ticket {
    /// Builds a ticket with `project` derived from the key. Returns `None` for malformed keys.
    pub fn with_key(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if !is_ticket_key(&key) {
            return None;
        }
        Some(Self {
            project: project_of(&key).to_string(),
            key,
            ..Default::default()
        })
    }

    /// Text handed to the embedding service: summary, description, status and priority,
    /// empty parts skipped.
    pub fn embedding_text(&self) -> String {
        [
            self.summary.as_str(),
            self.description.as_str(),
            self.status.as_str(),
            self.priority.as_str(),
        ]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub project: String,
    pub assignee: String,
    pub reporter: String,
    pub created: String,
    pub updated: String,
    pub source: String,
    pub extracted_at: DateTime<Utc>,
    pub vectorized: bool,
    pub raw_text: String,
}

/// Store-facing form of a ticket. `embedding` is `None` for degraded records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    pub external_id: String,
    pub title: String,
    pub status: String,
    pub priority: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: RecordMetadata,
}

impl IngestionRecord {
    pub fn external_id_for(namespace: &str, key: &str) -> String {
        format!("{namespace}:{key}")
    }

    pub fn from_ticket(
        ticket: &Ticket,
        namespace: &str,
        source: &str,
        extracted_at: DateTime<Utc>,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            external_id: Self::external_id_for(namespace, &ticket.key),
            title: ticket.summary.clone(),
            status: ticket.status.clone(),
            priority: ticket.priority.clone(),
            metadata: RecordMetadata {
                project: ticket.project.clone(),
                assignee: ticket.assignee.clone(),
                reporter: ticket.reporter.clone(),
                created: ticket.created.clone(),
                updated: ticket.updated.clone(),
                source: source.to_string(),
                extracted_at,
                vectorized: embedding.is_some(),
                raw_text: ticket.embedding_text(),
            },
            embedding,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.embedding.is_none()
    }
}
