//! Routing by `when => then` condition rules.
//!
//! A rule such as `method = find*,list => host = 10.0.0.1 & port != 20881`
//! applies to calls whose consumer side matches the `when` part and keeps
//! the providers that match the `then` part. Conditions are joined with
//! `&`; each compares one key against comma-separated glob patterns with
//! `=` or `!=`.
//!
//! Keys are `method`, `host`, `port`, `address`, `protocol` and `path`;
//! any other key names a URL parameter. An empty `when` matches every
//! call. An empty `then` excludes every provider.

use std::fmt;
use std::sync::Arc;

use dubbo_rpc::url::{CONDITION_FORCE_KEY, CONDITION_RULE_KEY};
use dubbo_rpc::{Invocation, Invoker, RpcError, Url};
use glob::Pattern;
use tracing::{debug, warn};

use super::Router;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Condition {
    key: String,
    patterns: Vec<Pattern>,
    negated: bool,
}

impl Condition {
    fn parse(raw: &str, rule: &str) -> Result<Self, RpcError> {
        let invalid = |why: &str| RpcError::InvalidRoute(format!("{rule}: {why} in `{raw}`"));

        let (key, values, negated) = if let Some((k, v)) = raw.split_once("!=") {
            (k, v, true)
        } else if let Some((k, v)) = raw.split_once('=') {
            (k, v, false)
        } else {
            return Err(invalid("missing `=` or `!=`"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        let patterns = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Pattern::new(v).map_err(|e| invalid(&e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(invalid("no values"));
        }
        Ok(Self {
            key: key.to_owned(),
            patterns,
            negated,
        })
    }

    fn matches(&self, url: &Url, method: &str) -> bool {
        let sample = match self.key.as_str() {
            "method" => Some(method.to_owned()),
            "host" => Some(url.host().to_owned()),
            "port" => Some(url.port().to_string()),
            "address" => Some(url.address()),
            "protocol" => Some(url.protocol().to_owned()),
            "path" => Some(url.path().to_owned()),
            key => url.param(key).map(str::to_owned),
        };
        let Some(sample) = sample else {
            return self.negated;
        };
        let hit = self.patterns.iter().any(|p| p.matches(&sample));
        hit != self.negated
    }
}

fn parse_conditions(part: &str, rule: &str) -> Result<Vec<Condition>, RpcError> {
    part.split('&')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| Condition::parse(c, rule))
        .collect()
}

/// Routes calls by a parsed condition rule.
///
/// When the `then` part leaves no provider the call goes to every provider
/// instead, unless the router is forced.
pub struct ConditionRouter {
    rule: String,
    when: Vec<Condition>,
    then: Vec<Condition>,
    blacklist: bool,
    force: bool,
}

impl ConditionRouter {
    /// Parses a rule.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRoute`] when a condition has no operator,
    /// no key, no values or a malformed pattern.
    pub fn parse(rule: &str, force: bool) -> Result<Self, RpcError> {
        let (when, then) = match rule.split_once("=>") {
            Some((when, then)) => (when.trim(), then.trim()),
            None => ("", rule.trim()),
        };
        Ok(Self {
            rule: rule.trim().to_owned(),
            when: parse_conditions(when, rule)?,
            then: parse_conditions(then, rule)?,
            blacklist: then.is_empty(),
            force,
        })
    }

    /// The router configured by `condition.rule` and `condition.force`, if
    /// the URL has a rule.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRoute`] when the rule does not parse.
    pub fn from_url(url: &Url) -> Result<Option<Self>, RpcError> {
        match url.param(CONDITION_RULE_KEY).map(str::trim) {
            Some(rule) if !rule.is_empty() => {
                Self::parse(rule, url.param_bool(CONDITION_FORCE_KEY, false)).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn applies_to(&self, url: &Url, invocation: &Invocation) -> bool {
        self.when
            .iter()
            .all(|c| c.matches(url, invocation.method()))
    }
}

impl fmt::Debug for ConditionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRouter")
            .field("rule", &self.rule)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl Router for ConditionRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        if invokers.is_empty() || !self.applies_to(url, invocation) {
            return invokers;
        }
        if self.blacklist {
            debug!(
                service = %url.service_key(),
                method = %invocation.method(),
                rule = %self.rule,
                "call excluded from every provider"
            );
            return Vec::new();
        }

        let method = invocation.method();
        let matched: Vec<_> = invokers
            .iter()
            .filter(|invoker| self.then.iter().all(|c| c.matches(invoker.url(), method)))
            .cloned()
            .collect();
        if matched.is_empty() && !self.force {
            warn!(
                service = %url.service_key(),
                method = %method,
                rule = %self.rule,
                "no provider matches route rule, routing to all"
            );
            return invokers;
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::testing::{as_dyn, MockInvoker};

    fn providers() -> Vec<Arc<MockInvoker>> {
        vec![
            MockInvoker::answering("dubbo://10.0.0.1:20880/svc?zone=east", "a"),
            MockInvoker::answering("dubbo://10.0.0.2:20880/svc?zone=west", "b"),
            MockInvoker::answering("dubbo://10.0.0.3:20881/svc?zone=east", "c"),
        ]
    }

    fn route(rule: &str, force: bool, consumer: &str, method: &str) -> Vec<String> {
        let router = ConditionRouter::parse(rule, force).unwrap();
        let url = Url::parse(consumer).unwrap();
        router
            .route(
                as_dyn(&providers()),
                &url,
                &Invocation::new(method, vec![]),
            )
            .iter()
            .map(|i| i.url().host().to_owned())
            .collect()
    }

    const CONSUMER: &str = "consumer://192.168.1.5/svc?application=shop";

    #[rstest]
    #[case("method = find* => host = 10.0.0.1", "findUser", &["10.0.0.1"])]
    #[case("method = find* => host = 10.0.0.1", "save", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])]
    #[case("method = find,list => zone = east", "list", &["10.0.0.1", "10.0.0.3"])]
    #[case("=> host != 10.0.0.2", "any", &["10.0.0.1", "10.0.0.3"])]
    #[case("host = 10.0.0.*", "any", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])]
    #[case("=> zone = east & port != 20881", "any", &["10.0.0.1"])]
    #[case("application = shop => address = 10.0.0.2:20880", "m", &["10.0.0.2"])]
    #[case("application = admin => host = 10.0.0.2", "m", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])]
    #[case("host = 192.168.* => zone = west", "m", &["10.0.0.2"])]
    #[case("method = get*User => host = 10.0.0.3", "getAdminUser", &["10.0.0.3"])]
    #[case("method = get*User => host = 10.0.0.3", "getUsers", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])]
    #[case("=> host = 10.0.0.[13]", "m", &["10.0.0.1", "10.0.0.3"])]
    fn routes_by_rule(#[case] rule: &str, #[case] method: &str, #[case] expected: &[&str]) {
        assert_eq!(route(rule, false, CONSUMER, method), expected);
    }

    #[test]
    fn empty_then_excludes_every_provider() {
        assert!(route("method = drop =>", false, CONSUMER, "drop").is_empty());
        assert_eq!(route("method = drop =>", false, CONSUMER, "keep").len(), 3);
    }

    #[test]
    fn unmatched_then_falls_back_unless_forced() {
        let rule = "=> zone = north";
        assert_eq!(route(rule, false, CONSUMER, "m").len(), 3);
        assert!(route(rule, true, CONSUMER, "m").is_empty());
    }

    #[test]
    fn missing_parameter_only_matches_negation() {
        assert_eq!(route("=> rack = r1", true, CONSUMER, "m").len(), 0);
        assert_eq!(route("=> rack != r1", true, CONSUMER, "m").len(), 3);
    }

    #[rstest]
    #[case("method => host = a")]
    #[case("= find => host = a")]
    #[case("method = => host = a")]
    #[case("=> host = a & zone")]
    #[case("=> host = [10")]
    fn malformed_rules_are_rejected(#[case] rule: &str) {
        assert!(matches!(
            ConditionRouter::parse(rule, false),
            Err(RpcError::InvalidRoute(_))
        ));
    }

    #[test]
    fn reads_rule_from_url() {
        let url = Url::parse("consumer://127.0.0.1/svc").unwrap();
        assert!(ConditionRouter::from_url(&url).unwrap().is_none());

        let url = url
            .with_param(CONDITION_RULE_KEY, "=> host = 10.0.0.1")
            .with_param(CONDITION_FORCE_KEY, true);
        let router = ConditionRouter::from_url(&url).unwrap().unwrap();
        assert!(router.force);
        assert_eq!(router.then.len(), 1);
    }
}
