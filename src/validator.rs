//! Response validation: classifies a finished page load into `ok` or a
//! typed block reason using an ordered block-signature table.
//!
//! The signature set is data, not code: each entry names the anti-bot
//! service, where to look (body text, title, header name, cookie name), and
//! the needle. Entries are walked in order and the first match wins, so
//! more specific signatures must come first.

use std::collections::HashMap;

use crate::models::OutcomeKind;

/// Where a block signature is looked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternField {
    /// Case-insensitive substring of the page body text.
    Body,
    /// Case-insensitive substring of the page title.
    Title,
    /// Response header name presence.
    Header,
    /// Cookie name presence.
    Cookie,
}

/// One entry of the block-signature table.
#[derive(Debug, Clone)]
pub struct BlockPattern {
    /// Service tag recorded as the block attribution.
    pub service: String,
    /// Human-readable description of the signal, for operator logs.
    pub signal: String,
    pub field: PatternField,
    /// Lowercase needle: substring for body/title, exact name for headers,
    /// name prefix for cookies (vendors suffix cookie names with site ids,
    /// e.g. `visid_incap_<siteid>`).
    pub needle: String,
    /// Outcome class this signature maps to.
    pub kind: OutcomeKind,
}

impl BlockPattern {
    fn new(
        service: &str,
        signal: &str,
        field: PatternField,
        needle: &str,
        kind: OutcomeKind,
    ) -> Self {
        BlockPattern {
            service: service.to_string(),
            signal: signal.to_string(),
            field,
            needle: needle.to_string(),
            kind,
        }
    }
}

/// Everything the validator looks at after navigation settles.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub http_status: Option<u16>,
    pub final_url: String,
    pub title: String,
    /// Lowercased body text, capped by the caller.
    pub body_text: String,
    /// Response headers with lowercased names.
    pub headers: HashMap<String, String>,
    /// Names of cookies observed on the page.
    pub cookies: Vec<String>,
}

/// Typed classification of one page load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Blocked { service: String },
    Captcha { service: String },
    RateLimited { service: String },
    Empty,
}

impl Verdict {
    pub fn outcome_kind(&self) -> OutcomeKind {
        match self {
            Verdict::Ok => OutcomeKind::Ok,
            Verdict::Blocked { .. } => OutcomeKind::Blocked,
            Verdict::Captcha { .. } => OutcomeKind::Captcha,
            Verdict::RateLimited { .. } => OutcomeKind::RateLimited,
            Verdict::Empty => OutcomeKind::Empty,
        }
    }

    pub fn block_service(&self) -> Option<&str> {
        match self {
            Verdict::Blocked { service }
            | Verdict::Captcha { service }
            | Verdict::RateLimited { service } => Some(service),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Verdict::Ok)
    }
}

/// The default block-signature table. Earlier entries are more specific and
/// win ties; keep vendor headers ahead of body heuristics.
pub fn default_patterns() -> Vec<BlockPattern> {
    use OutcomeKind::{Blocked, Captcha, RateLimited};
    use PatternField::{Body, Cookie, Header, Title};

    vec![
        // Vendor-identifying headers.
        BlockPattern::new("cloudfront", "edge header", Header, "x-amz-cf-id", Blocked),
        BlockPattern::new("cloudfront", "edge pop header", Header, "x-amz-cf-pop", Blocked),
        BlockPattern::new("akamai", "request-id header", Header, "x-akamai-request-id", Blocked),
        BlockPattern::new("imperva", "iinfo header", Header, "x-iinfo", Blocked),
        BlockPattern::new("datadome", "vendor header", Header, "x-datadome", Blocked),
        // Cloudflare interstitial.
        BlockPattern::new("cloudflare", "challenge page", Body, "just a moment", Blocked),
        BlockPattern::new("cloudflare", "browser check", Body, "checking your browser", Blocked),
        BlockPattern::new(
            "cloudflare",
            "challenge markup",
            Body,
            "cf-browser-verification",
            Blocked,
        ),
        BlockPattern::new("cloudflare", "attention title", Title, "attention required", Blocked),
        // PerimeterX / HUMAN.
        BlockPattern::new("perimeterx", "press & hold wall", Body, "press & hold", Blocked),
        BlockPattern::new("perimeterx", "vendor markup", Body, "perimeterx", Blocked),
        BlockPattern::new("perimeterx", "px cookie", Cookie, "_px3", Blocked),
        // DataDome.
        BlockPattern::new("datadome", "vendor markup", Body, "datadome", Blocked),
        BlockPattern::new("datadome", "dd cookie", Cookie, "datadome", Blocked),
        // Imperva / Incapsula.
        BlockPattern::new("imperva", "incident page", Body, "incapsula incident", Blocked),
        BlockPattern::new("imperva", "incap cookie", Cookie, "visid_incap", Blocked),
        // Akamai error references.
        BlockPattern::new("akamai", "edge error page", Body, "errors.edgesuite.net", Blocked),
        // CAPTCHAs of any vendor.
        BlockPattern::new("captcha", "recaptcha widget", Body, "recaptcha", Captcha),
        BlockPattern::new("captcha", "hcaptcha widget", Body, "hcaptcha", Captcha),
        BlockPattern::new("captcha", "turnstile widget", Body, "cf-turnstile", Captcha),
        BlockPattern::new("captcha", "human check", Body, "verify you are human", Captcha),
        BlockPattern::new("captcha", "captcha title", Title, "captcha", Captcha),
        // Rate limiting.
        BlockPattern::new("rate-limit", "429 body", Body, "too many requests", RateLimited),
        BlockPattern::new("rate-limit", "quota body", Body, "rate limit exceeded", RateLimited),
    ]
}

/// Classifies page loads against a signature table and a length floor.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    patterns: Vec<BlockPattern>,
    min_content_length: usize,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        ResponseValidator::new(default_patterns(), 500)
    }
}

impl ResponseValidator {
    pub fn new(patterns: Vec<BlockPattern>, min_content_length: usize) -> Self {
        ResponseValidator {
            patterns,
            min_content_length,
        }
    }

    /// Classifies a snapshot. See the module docs for precedence: a
    /// signature match attributes the block even on an error status;
    /// `http_<status>` is the fallback attribution when nothing matched.
    pub fn classify(&self, snapshot: &PageSnapshot) -> Verdict {
        let hit = self.first_match(snapshot);

        if let Some(status) = snapshot.http_status {
            if status >= 400 {
                return match hit {
                    Some(pattern) => verdict_for(pattern),
                    None if status == 429 => Verdict::RateLimited {
                        service: format!("http_{status}"),
                    },
                    None => Verdict::Blocked {
                        service: format!("http_{status}"),
                    },
                };
            }
        }

        if let Some(pattern) = hit {
            return verdict_for(pattern);
        }

        if snapshot.body_text.len() < self.min_content_length {
            let body = &snapshot.body_text;
            if body.contains("error") || body.contains("denied") || body.contains("forbidden") {
                return Verdict::Empty;
            }
        }

        Verdict::Ok
    }

    fn first_match(&self, snapshot: &PageSnapshot) -> Option<&BlockPattern> {
        let title = snapshot.title.to_lowercase();
        self.patterns.iter().find(|pattern| match pattern.field {
            PatternField::Body => snapshot.body_text.contains(&pattern.needle),
            PatternField::Title => title.contains(&pattern.needle),
            PatternField::Header => snapshot.headers.contains_key(&pattern.needle),
            PatternField::Cookie => snapshot
                .cookies
                .iter()
                .any(|c| c.to_lowercase().starts_with(&pattern.needle)),
        })
    }
}

fn verdict_for(pattern: &BlockPattern) -> Verdict {
    let service = pattern.service.clone();
    match pattern.kind {
        OutcomeKind::Captcha => Verdict::Captcha { service },
        OutcomeKind::RateLimited => Verdict::RateLimited { service },
        _ => Verdict::Blocked { service },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: u16, body: &str) -> PageSnapshot {
        PageSnapshot {
            http_status: Some(status),
            body_text: body.to_lowercase(),
            ..PageSnapshot::default()
        }
    }

    #[test]
    fn cloudflare_challenge_attributes_the_vendor_not_the_status() {
        let validator = ResponseValidator::default();
        let verdict = validator.classify(&snapshot(403, "Just a moment... checking"));
        assert_eq!(
            verdict,
            Verdict::Blocked {
                service: "cloudflare".into()
            }
        );
    }

    #[test]
    fn bare_error_status_falls_back_to_http_attribution() {
        let validator = ResponseValidator::default();
        let verdict = validator.classify(&snapshot(503, "service unavailable right now, sorry"));
        assert_eq!(
            verdict,
            Verdict::Blocked {
                service: "http_503".into()
            }
        );
    }

    #[test]
    fn status_429_without_signature_is_rate_limited() {
        let validator = ResponseValidator::default();
        let verdict = validator.classify(&snapshot(429, "slow down"));
        assert_eq!(
            verdict,
            Verdict::RateLimited {
                service: "http_429".into()
            }
        );
    }

    #[test]
    fn header_presence_identifies_cloudfront() {
        let validator = ResponseValidator::default();
        let mut snap = snapshot(403, "access denied");
        snap.headers.insert("x-amz-cf-id".into(), "abc123".into());
        assert_eq!(
            validator.classify(&snap),
            Verdict::Blocked {
                service: "cloudfront".into()
            }
        );
    }

    #[test]
    fn captcha_body_on_ok_status_is_captcha() {
        let validator = ResponseValidator::default();
        let verdict = validator.classify(&snapshot(
            200,
            &"please solve this recaptcha to continue ".repeat(30),
        ));
        assert_eq!(
            verdict,
            Verdict::Captcha {
                service: "captcha".into()
            }
        );
    }

    #[test]
    fn earlier_pattern_wins_when_both_match() {
        // A Cloudflare challenge embedding a turnstile widget is attributed
        // to cloudflare because its signatures come first.
        let validator = ResponseValidator::default();
        let verdict = validator.classify(&snapshot(403, "just a moment cf-turnstile"));
        assert_eq!(
            verdict,
            Verdict::Blocked {
                service: "cloudflare".into()
            }
        );
    }

    #[test]
    fn short_error_body_is_empty() {
        let validator = ResponseValidator::default();
        assert_eq!(
            validator.classify(&snapshot(200, "error: nothing here")),
            Verdict::Empty
        );
    }

    #[test]
    fn short_benign_body_is_ok() {
        let validator = ResponseValidator::default();
        assert_eq!(validator.classify(&snapshot(200, "hello world")), Verdict::Ok);
    }

    #[test]
    fn long_page_is_ok() {
        let validator = ResponseValidator::default();
        let body = "perfectly ordinary content ".repeat(40);
        assert_eq!(validator.classify(&snapshot(200, &body)), Verdict::Ok);
    }

    #[test]
    fn cookie_name_identifies_datadome() {
        let validator = ResponseValidator::default();
        let mut snap = snapshot(200, &"plenty of page content here ".repeat(30));
        snap.cookies.push("datadome".into());
        assert_eq!(
            validator.classify(&snap),
            Verdict::Blocked {
                service: "datadome".into()
            }
        );
    }

    #[test]
    fn suffixed_vendor_cookies_match_by_prefix() {
        // Imperva appends a site id to its cookie names.
        let validator = ResponseValidator::default();
        let mut snap = snapshot(200, &"plenty of page content here ".repeat(30));
        snap.cookies.push("visid_incap_2263604".into());
        assert_eq!(
            validator.classify(&snap),
            Verdict::Blocked {
                service: "imperva".into()
            }
        );
    }
}
