//! Evidence ledger merges: sources by normalized URL, facts and assumptions
//! by normalized claim text.

use scenario_state::{Assumption, EvidenceSection, EvidenceSource, Fact};

/// Canonical form of a source URL.
///
/// Trims whitespace, lowercases scheme and host, drops the fragment and any
/// trailing `/` on the path. Query strings are kept as-is.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once('#').map_or(url, |(head, _)| head);

    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, url),
    };

    let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
    let host = rest[..authority_end].to_ascii_lowercase();
    let tail = &rest[authority_end..];
    let (path, query) = match tail.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (tail, None),
    };
    let path = path.trim_end_matches('/');

    let mut normalized = String::with_capacity(url.len());
    if let Some(scheme) = scheme {
        normalized.push_str(&scheme);
        normalized.push_str("://");
    }
    normalized.push_str(&host);
    normalized.push_str(path);
    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(query);
    }
    normalized
}

/// Claim identity for de-duplication: lowercased, whitespace collapsed.
pub fn normalize_claim(claim: &str) -> String {
    claim
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn union_into(target: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Merge sources by normalized URL. Returns how many new entries were added.
///
/// Existing entries keep their position; matches get the snippet union
/// (order-preserving) and the max quality score.
pub fn merge_sources(existing: &mut Vec<EvidenceSource>, incoming: Vec<EvidenceSource>) -> usize {
    let mut added = 0;
    for mut source in incoming {
        source.normalized_url = normalize_url(&source.url);
        match existing
            .iter_mut()
            .find(|s| s.normalized_url == source.normalized_url)
        {
            Some(current) => {
                union_into(&mut current.snippets, &source.snippets);
                current.quality_score = current.quality_score.max(source.quality_score);
                if current.title.is_empty() {
                    current.title = source.title;
                }
            }
            None => {
                let mut deduped = Vec::new();
                union_into(&mut deduped, &source.snippets);
                source.snippets = deduped;
                existing.push(source);
                added += 1;
            }
        }
    }
    added
}

/// Insert or fold a fact into the evidence section.
pub fn upsert_fact(evidence: &mut EvidenceSection, fact: Fact) {
    let key = normalize_claim(&fact.claim);
    match evidence
        .facts
        .iter_mut()
        .find(|f| normalize_claim(&f.claim) == key)
    {
        Some(current) => {
            union_into(&mut current.sources, &fact.sources);
            current.confidence = current.confidence.max(fact.confidence);
            if current.target_path.is_none() {
                current.target_path = fact.target_path;
            }
        }
        None => evidence.facts.push(fact),
    }
}

/// Insert or fold an assumption into the evidence section.
pub fn upsert_assumption(evidence: &mut EvidenceSection, assumption: Assumption) {
    let key = normalize_claim(&assumption.claim);
    match evidence
        .assumptions
        .iter_mut()
        .find(|a| normalize_claim(&a.claim) == key)
    {
        Some(current) => {
            current.confidence = current.confidence.max(assumption.confidence);
            if current.target_path.is_none() {
                current.target_path = assumption.target_path;
            }
        }
        None => evidence.assumptions.push(assumption),
    }
}
