//! Ordered rewrite rules applied to every request path before tenant
//! dispatch.
//!
//! A rule carries a compiled regex, a replacement (with `$n` back
//! references), and a flag deciding what a match means: an external 302
//! redirect, an internal rewrite (`last`), or a fly-replay handoff to
//! another machine. Declaration order is evaluation order and the first
//! match wins.

use hyper::Method;
use regex::Regex;

use anyhow::Context;

/// Where a fly-replay rule sends the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayTarget {
    App(String),
    Region(String),
}

impl ReplayTarget {
    /// Header value fragment, e.g. `app=compute` or `region=syd`.
    pub fn header_value(&self) -> String {
        match self {
            ReplayTarget::App(name) => format!("app={name}"),
            ReplayTarget::Region(region) => format!("region={region}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFlag {
    /// Respond 302 with the substituted location.
    Redirect,
    /// Replace the request path and stop evaluating further rules.
    Last,
    /// Hand off to the fly-replay emitter with this target and status.
    FlyReplay { target: ReplayTarget, status: u16 },
}

impl RuleFlag {
    /// Parse the textual flag from configuration: `redirect`, `last`, or
    /// `fly-replay:<target>:<status>` where `<target>` is `app=<name>`,
    /// `region=<region>`, or a bare region name.
    pub fn parse(s: &str) -> anyhow::Result<RuleFlag> {
        match s {
            "redirect" => Ok(RuleFlag::Redirect),
            "last" => Ok(RuleFlag::Last),
            _ => {
                let rest = s
                    .strip_prefix("fly-replay:")
                    .with_context(|| format!("unknown rewrite flag {s:?}"))?;
                let (target, status) = rest
                    .rsplit_once(':')
                    .with_context(|| format!("fly-replay flag {s:?} is missing a status"))?;
                let status: u16 = status
                    .parse()
                    .with_context(|| format!("fly-replay status {status:?} is not a number"))?;
                anyhow::ensure!(
                    (100..=599).contains(&status),
                    "fly-replay status {status} out of range"
                );
                let target = match target.split_once('=') {
                    Some(("app", name)) => ReplayTarget::App(name.to_string()),
                    Some(("region", region)) => ReplayTarget::Region(region.to_string()),
                    Some((kind, _)) => anyhow::bail!("unknown fly-replay target kind {kind:?}"),
                    None => ReplayTarget::Region(target.to_string()),
                };
                Ok(RuleFlag::FlyReplay { target, status })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
    flag: RuleFlag,
    /// Empty set means "all methods".
    methods: Vec<Method>,
}

impl RewriteRule {
    pub fn new(
        pattern: &str,
        replacement: &str,
        flag: RuleFlag,
        methods: Vec<Method>,
    ) -> anyhow::Result<Self> {
        Ok(RewriteRule {
            pattern: Regex::new(pattern)
                .with_context(|| format!("compiling rewrite pattern {pattern:?}"))?,
            replacement: replacement.to_string(),
            flag,
            methods,
        })
    }

    fn matches_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    fn substitute(&self, path: &str) -> String {
        self.pattern
            .replace_all(path, self.replacement.as_str())
            .into_owned()
    }
}

/// Outcome of running a path through the rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// No rule matched; the path is unchanged.
    PassThrough,
    /// A `redirect` rule matched: respond 302 Found at `location`.
    Redirect { location: String },
    /// A `last` rule matched: continue the pipeline with the new path.
    Rewritten { path: String },
    /// A fly-replay rule matched.
    FlyReplay { target: ReplayTarget, status: u16 },
}

/// The compiled, ordered rule list for one configuration snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RewriteRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        RuleSet { rules }
    }

    /// Append the automatic trailing-slash redirects the config loader adds
    /// for every tenant scope and the global root path: `GET /foo` becomes a
    /// 302 to `/foo/` when `/foo/` is a known scope.
    pub fn add_trailing_slash_rules<'a>(
        &mut self,
        scopes: impl IntoIterator<Item = &'a str>,
    ) -> anyhow::Result<()> {
        for scope in scopes {
            let Some(bare) = scope.strip_suffix('/') else {
                continue;
            };
            if bare.is_empty() {
                // "/" has no slash-less form.
                continue;
            }
            self.rules.push(RewriteRule::new(
                &format!("^{}$", regex::escape(bare)),
                scope,
                RuleFlag::Redirect,
                Vec::new(),
            )?);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate rules in declaration order; the first match decides. At most
    /// one substitution is performed per request.
    pub fn evaluate(&self, path: &str, method: &Method) -> RuleOutcome {
        for rule in &self.rules {
            if !rule.matches_method(method) {
                continue;
            }
            if !rule.pattern.is_match(path) {
                continue;
            }
            return match &rule.flag {
                RuleFlag::Redirect => RuleOutcome::Redirect {
                    location: rule.substitute(path),
                },
                RuleFlag::Last => RuleOutcome::Rewritten {
                    path: rule.substitute(path),
                },
                RuleFlag::FlyReplay { target, status } => RuleOutcome::FlyReplay {
                    target: target.clone(),
                    status: *status,
                },
            };
        }
        RuleOutcome::PassThrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, replacement: &str, flag: RuleFlag) -> RewriteRule {
        RewriteRule::new(pattern, replacement, flag, Vec::new()).unwrap()
    }

    #[test]
    fn first_match_wins_and_last_stops_evaluation() {
        let rules = RuleSet::new(vec![
            rule("^/api/v1/(.*)", "/v1/$1", RuleFlag::Last),
            // Would also match the rewritten path, but must never run.
            rule("^/v1/(.*)", "/nope/$1", RuleFlag::Last),
        ]);
        assert_eq!(
            rules.evaluate("/api/v1/users", &Method::GET),
            RuleOutcome::Rewritten {
                path: "/v1/users".to_string()
            }
        );
    }

    #[test]
    fn redirect_substitutes_back_references() {
        let rules = RuleSet::new(vec![rule(
            "^/old/(.*)$",
            "/new/$1",
            RuleFlag::Redirect,
        )]);
        assert_eq!(
            rules.evaluate("/old/thing", &Method::GET),
            RuleOutcome::Redirect {
                location: "/new/thing".to_string()
            }
        );
    }

    #[test]
    fn no_match_passes_through() {
        let rules = RuleSet::new(vec![rule("^/old/", "/new/", RuleFlag::Redirect)]);
        assert_eq!(
            rules.evaluate("/other", &Method::GET),
            RuleOutcome::PassThrough
        );
    }

    #[test]
    fn method_filter_restricts_matches() {
        let r = RewriteRule::new("^/form$", "/submitted", RuleFlag::Last, vec![Method::POST])
            .unwrap();
        let rules = RuleSet::new(vec![r]);
        assert_eq!(rules.evaluate("/form", &Method::GET), RuleOutcome::PassThrough);
        assert_eq!(
            rules.evaluate("/form", &Method::POST),
            RuleOutcome::Rewritten {
                path: "/submitted".to_string()
            }
        );
    }

    #[test]
    fn fly_replay_flag_parses_targets_and_status() {
        assert_eq!(
            RuleFlag::parse("fly-replay:app=compute:307").unwrap(),
            RuleFlag::FlyReplay {
                target: ReplayTarget::App("compute".to_string()),
                status: 307
            }
        );
        assert_eq!(
            RuleFlag::parse("fly-replay:region=syd:302").unwrap(),
            RuleFlag::FlyReplay {
                target: ReplayTarget::Region("syd".to_string()),
                status: 302
            }
        );
        // Bare target is a region.
        assert_eq!(
            RuleFlag::parse("fly-replay:fra:307").unwrap(),
            RuleFlag::FlyReplay {
                target: ReplayTarget::Region("fra".to_string()),
                status: 307
            }
        );
        assert!(RuleFlag::parse("fly-replay:app=x").is_err());
        assert!(RuleFlag::parse("bogus").is_err());
    }

    #[test]
    fn trailing_slash_rules_redirect_bare_scopes() {
        let mut rules = RuleSet::new(Vec::new());
        rules
            .add_trailing_slash_rules(["/showcase/2025/raleigh/", "/"])
            .unwrap();
        assert_eq!(
            rules.evaluate("/showcase/2025/raleigh", &Method::GET),
            RuleOutcome::Redirect {
                location: "/showcase/2025/raleigh/".to_string()
            }
        );
        // Longer paths under the scope are untouched.
        assert_eq!(
            rules.evaluate("/showcase/2025/raleigh/index", &Method::GET),
            RuleOutcome::PassThrough
        );
    }
}
