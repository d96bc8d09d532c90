//! Relevance-based tool selection.
//!
//! Models get confused (and prompts get expensive) when every catalog tool is
//! bound, so each turn binds at most `max_tools` tools picked for the query:
//!
//! 1. **Domain detection**: the query is matched against a fixed catalog of
//!    integration domains, each with strong and contextual keywords.
//! 2. **Domain-specific path**: exactly one high/medium confidence domain
//!    means only that domain's tools are bound (plus a small core quota at
//!    medium confidence).
//! 3. **General path**: core tools first, then a per-domain quota for every
//!    candidate domain (must-have tools first), then a global backfill.
//!
//! Selection is recomputed for every query and never cached.

use std::collections::HashSet;
use std::sync::Arc;

use crate::tool::{Tool, ToolRegistry, ToolSource};

/// Tools every general selection starts with.
pub const CORE_TOOLS: &[&str] = &["web_search", "generate_image", "get_current_time"];

/// Core tools reserved next to a medium-confidence domain.
const MEDIUM_CORE_TOOLS: &[&str] = &["web_search", "get_current_time"];

/// Minimum slots each candidate domain gets on the general path.
const MIN_DOMAIN_QUOTA: usize = 2;

/// Score bonus for a domain's must-have tools on the domain path.
const MUST_HAVE_BONUS: usize = 3;

/// Words ignored when scoring.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "to", "of", "in", "on", "for", "and", "or", "is", "are", "be", "me", "my",
    "i", "you", "it", "this", "that", "with", "please", "can", "could", "would", "what", "at",
];

// ─────────────────────────────────────────────────────────────────────────────
// Domain Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// A family of related integration tools.
#[derive(Debug)]
pub struct Domain {
    /// Domain key; also the MCP server name that serves it.
    pub name: &'static str,
    /// Coarse grouping.
    pub category: &'static str,
    /// Words that name the integration itself.
    pub strong: &'static [&'static str],
    /// Words that suggest the integration's kind of work.
    pub contextual: &'static [&'static str],
    /// Substrings identifying the domain's tools by name.
    pub tool_markers: &'static [&'static str],
    /// Tools to prefer when the domain gets few slots.
    pub must_have: &'static [&'static str],
}

impl Domain {
    /// Whether a tool belongs to this domain.
    pub fn owns(&self, tool: &dyn Tool) -> bool {
        if let ToolSource::Remote { server } = tool.source() {
            if server.eq_ignore_ascii_case(self.name) {
                return true;
            }
        }
        let name = tool.name().to_lowercase();
        self.tool_markers.iter().any(|marker| name.contains(marker))
    }
}

/// The fixed domain catalog.
pub static DOMAINS: &[Domain] = &[
    Domain {
        name: "slack",
        category: "communication",
        strong: &["slack"],
        contextual: &["message", "channel", "dm", "thread", "post", "workspace"],
        tool_markers: &["slack"],
        must_have: &["send_slack_message", "list_slack_channels"],
    },
    Domain {
        name: "gmail",
        category: "communication",
        strong: &["gmail", "email", "e-mail", "inbox"],
        contextual: &["send", "reply", "draft", "unread", "attachment", "mail"],
        tool_markers: &["gmail", "email"],
        must_have: &["send_email", "search_emails"],
    },
    Domain {
        name: "zoom",
        category: "communication",
        strong: &["zoom"],
        contextual: &["meeting", "schedule", "call", "webinar", "invite"],
        tool_markers: &["zoom"],
        must_have: &["create_zoom_meeting", "list_zoom_meetings"],
    },
    Domain {
        name: "google_calendar",
        category: "productivity",
        strong: &["calendar", "google calendar"],
        contextual: &["event", "meeting", "schedule", "availability", "tomorrow", "appointment"],
        tool_markers: &["calendar"],
        must_have: &["create_calendar_event", "list_calendar_events"],
    },
    Domain {
        name: "github",
        category: "development",
        strong: &["github", "pull request", "repo", "repository"],
        contextual: &["issue", "commit", "branch", "merge", "review", "code"],
        tool_markers: &["github"],
        must_have: &["create_github_issue", "list_github_pull_requests"],
    },
    Domain {
        name: "jira",
        category: "development",
        strong: &["jira"],
        contextual: &["ticket", "issue", "sprint", "epic", "backlog", "story"],
        tool_markers: &["jira"],
        must_have: &["create_jira_issue", "search_jira_issues"],
    },
    Domain {
        name: "google_drive",
        category: "storage",
        strong: &["google drive", "gdrive"],
        contextual: &["file", "folder", "document", "share", "upload", "spreadsheet"],
        tool_markers: &["drive"],
        must_have: &["search_drive_files", "upload_drive_file"],
    },
    Domain {
        name: "dropbox",
        category: "storage",
        strong: &["dropbox"],
        contextual: &["file", "folder", "share", "upload", "download"],
        tool_markers: &["dropbox"],
        must_have: &["search_dropbox_files", "upload_dropbox_file"],
    },
    Domain {
        name: "notion",
        category: "productivity",
        strong: &["notion"],
        contextual: &["page", "database", "note", "wiki", "document"],
        tool_markers: &["notion"],
        must_have: &["search_notion_pages", "create_notion_page"],
    },
];

/// How sure the detector is that the query is about a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    /// One strong keyword, nothing else.
    Medium,
    /// A strong keyword plus a contextual one, or several strong keywords.
    High,
}

/// A domain the query matched.
#[derive(Debug, Clone)]
pub struct DomainMatch {
    /// The matched domain.
    pub domain: &'static Domain,
    /// Detector confidence.
    pub confidence: Confidence,
    /// Strong keywords found.
    pub strong_hits: usize,
    /// Contextual keywords found.
    pub contextual_hits: usize,
}

/// Query text lowercased, punctuation folded to single spaces, space-padded.
fn normalize(text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    format!(" {} ", folded.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Whole-word (or phrase) match, accepting a plural "s".
fn contains_keyword(normalized: &str, keyword: &str) -> bool {
    normalized.contains(&format!(" {} ", keyword)) || normalized.contains(&format!(" {}s ", keyword))
}

/// Domains mentioned by a query, in catalog order.
pub fn detect_domains(query: &str) -> Vec<DomainMatch> {
    let normalized = normalize(query);
    DOMAINS
        .iter()
        .filter_map(|domain| {
            let strong_hits = domain
                .strong
                .iter()
                .filter(|k| contains_keyword(&normalized, k))
                .count();
            if strong_hits == 0 {
                return None;
            }
            let contextual_hits = domain
                .contextual
                .iter()
                .filter(|k| contains_keyword(&normalized, k))
                .count();
            let confidence = if contextual_hits > 0 || strong_hits > 1 {
                Confidence::High
            } else {
                Confidence::Medium
            };
            Some(DomainMatch {
                domain,
                confidence,
                strong_hits,
                contextual_hits,
            })
        })
        .collect()
}

/// Whether a query looks like it needs tools at all.
///
/// Small talk and self-contained questions get a toolless model.
pub fn classify_tool_eligibility(query: &str) -> bool {
    const TRIGGERS: &[&str] = &[
        "search", "look up", "lookup", "find", "latest", "news", "today", "current", "now",
        "time", "date", "weather", "price", "stock", "image", "picture", "photo", "draw",
        "generate", "website", "http", "https", "www", "send", "schedule", "create",
    ];
    if !detect_domains(query).is_empty() {
        return true;
    }
    let normalized = normalize(query);
    TRIGGERS.iter().any(|t| contains_keyword(&normalized, t))
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────────────────────────

fn stem(word: &str) -> &str {
    if word.len() > 3 {
        word.strip_suffix('s').unwrap_or(word)
    } else {
        word
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(w))
        .map(|w| stem(w).to_string())
        .collect()
}

/// Keyword overlap between a query and a tool: 2 per name hit, 1 per description hit.
pub fn score_tool(query_tokens: &HashSet<String>, tool: &dyn Tool) -> usize {
    let name = tokens(tool.name());
    let description = tokens(tool.description());
    query_tokens
        .iter()
        .map(|t| {
            if name.contains(t) {
                2
            } else if description.contains(t) {
                1
            } else {
                0
            }
        })
        .sum()
}

/// Stable sort by descending score; ties keep catalog order.
fn rank(tools: Vec<Arc<dyn Tool>>, score: impl Fn(&dyn Tool) -> usize) -> Vec<Arc<dyn Tool>> {
    let mut scored: Vec<(usize, Arc<dyn Tool>)> =
        tools.into_iter().map(|t| (score(t.as_ref()), t)).collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, t)| t).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Selection
// ─────────────────────────────────────────────────────────────────────────────

/// Which path produced a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPath {
    /// One domain matched; only its tools (plus core at medium confidence).
    DomainSpecific {
        /// Domain name.
        domain: &'static str,
        /// Detector confidence.
        confidence: Confidence,
    },
    /// Core tools plus per-domain quotas plus backfill.
    General {
        /// Candidate domains that received a quota.
        domains: Vec<&'static str>,
    },
}

/// Tools chosen for one query.
#[derive(Debug)]
pub struct Selection {
    /// Selected tools, most relevant first.
    pub tools: ToolRegistry,
    /// How they were chosen.
    pub path: SelectionPath,
}

struct Picker {
    picked: Vec<Arc<dyn Tool>>,
    names: HashSet<String>,
    max: usize,
}

impl Picker {
    fn new(max: usize) -> Self {
        Self {
            picked: Vec::new(),
            names: HashSet::new(),
            max,
        }
    }

    fn is_full(&self) -> bool {
        self.picked.len() >= self.max
    }

    fn remaining(&self) -> usize {
        self.max.saturating_sub(self.picked.len())
    }

    fn take(&mut self, tool: &Arc<dyn Tool>) -> bool {
        if self.is_full() || !self.names.insert(tool.name().to_string()) {
            return false;
        }
        self.picked.push(Arc::clone(tool));
        true
    }

    fn into_registry(self) -> ToolRegistry {
        self.picked.into_iter().collect()
    }
}

/// Pick at most `max_tools` tools from `available` for `query`.
///
/// Never returns duplicates. Ties keep catalog order.
pub fn select_tools(query: &str, available: &ToolRegistry, max_tools: usize) -> Selection {
    let query_tokens = tokens(query);
    let matches = detect_domains(query);
    let catalog: Vec<Arc<dyn Tool>> = available.tools().to_vec();

    if let [only] = matches.as_slice() {
        let domain_tools: Vec<Arc<dyn Tool>> = catalog
            .iter()
            .filter(|t| only.domain.owns(t.as_ref()))
            .cloned()
            .collect();
        if !domain_tools.is_empty() {
            let selection = select_for_domain(only, domain_tools, &catalog, &query_tokens, max_tools);
            tracing::debug!(
                domain = only.domain.name,
                confidence = ?only.confidence,
                selected = ?selection.tools.names(),
                "Tool selection: domain path"
            );
            return selection;
        }
    }

    let selection = select_general(&matches, &catalog, &query_tokens, max_tools);
    tracing::debug!(
        matched = matches.len(),
        selected = ?selection.tools.names(),
        "Tool selection: general path"
    );
    selection
}

fn select_for_domain(
    matched: &DomainMatch,
    domain_tools: Vec<Arc<dyn Tool>>,
    catalog: &[Arc<dyn Tool>],
    query_tokens: &HashSet<String>,
    max_tools: usize,
) -> Selection {
    let domain = matched.domain;
    let ranked = rank(domain_tools, |t| {
        let bonus = if domain.must_have.contains(&t.name()) {
            MUST_HAVE_BONUS
        } else {
            0
        };
        score_tool(query_tokens, t) + bonus
    });

    let mut picker = Picker::new(max_tools);
    let core: Vec<&Arc<dyn Tool>> = if matched.confidence == Confidence::Medium {
        MEDIUM_CORE_TOOLS
            .iter()
            .filter_map(|name| catalog.iter().find(|t| t.name() == *name))
            .collect()
    } else {
        Vec::new()
    };

    let domain_slots = max_tools.saturating_sub(core.len()).max(1).min(max_tools);
    for tool in ranked.iter().take(domain_slots) {
        picker.take(tool);
    }
    for tool in core {
        picker.take(tool);
    }

    Selection {
        tools: picker.into_registry(),
        path: SelectionPath::DomainSpecific {
            domain: domain.name,
            confidence: matched.confidence,
        },
    }
}

fn select_general(
    matches: &[DomainMatch],
    catalog: &[Arc<dyn Tool>],
    query_tokens: &HashSet<String>,
    max_tools: usize,
) -> Selection {
    let mut picker = Picker::new(max_tools);

    for name in CORE_TOOLS {
        if let Some(tool) = catalog.iter().find(|t| t.name() == *name) {
            picker.take(tool);
        }
    }

    // Matched domains, or every domain present in the catalog
    let candidates: Vec<&'static Domain> = if matches.is_empty() {
        DOMAINS
            .iter()
            .filter(|d| catalog.iter().any(|t| d.owns(t.as_ref())))
            .collect()
    } else {
        matches.iter().map(|m| m.domain).collect()
    };

    if !candidates.is_empty() {
        let quota = (picker.remaining() / candidates.len()).max(MIN_DOMAIN_QUOTA);
        for domain in &candidates {
            let owned: Vec<Arc<dyn Tool>> = catalog
                .iter()
                .filter(|t| domain.owns(t.as_ref()))
                .cloned()
                .collect();

            let must_have = domain
                .must_have
                .iter()
                .filter_map(|name| owned.iter().find(|t| t.name() == *name).cloned());
            let by_score = rank(owned.clone(), |t| score_tool(query_tokens, t));

            let mut taken = 0;
            for tool in must_have.chain(by_score) {
                if taken >= quota || picker.is_full() {
                    break;
                }
                if picker.take(&tool) {
                    taken += 1;
                }
            }
        }
    }

    for tool in rank(catalog.to_vec(), |t| score_tool(query_tokens, t)) {
        if picker.is_full() {
            break;
        }
        picker.take(&tool);
    }

    Selection {
        tools: picker.into_registry(),
        path: SelectionPath::General {
            domains: candidates.iter().map(|d| d.name).collect(),
        },
    }
}
