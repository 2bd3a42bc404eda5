/// Lifecycle phase an action string is parsed and executed for. The phase
/// decides which verbs are legal and how failures propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionContext {
    Start,
    Stop,
    Watch,
}

impl ActionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionContext::Start => "start",
            ActionContext::Stop => "stop",
            ActionContext::Watch => "watch",
        }
    }
}

impl std::fmt::Display for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Exec,
    Wait,
    Start,
    Stop,
    Http,
    Https,
    Sleep,
    Service,
}

impl Verb {
    fn parse(s: &str) -> Option<Verb> {
        match s {
            "exec" => Some(Verb::Exec),
            "wait" => Some(Verb::Wait),
            "start" => Some(Verb::Start),
            "stop" => Some(Verb::Stop),
            "http" => Some(Verb::Http),
            "https" => Some(Verb::Https),
            "sleep" => Some(Verb::Sleep),
            "service" => Some(Verb::Service),
            _ => None,
        }
    }

    /// The per-phase verb table. `service` talks to the OS service manager
    /// and exists on Windows only; elsewhere it behaves like an unknown verb.
    fn allowed_in(self, ctx: ActionContext) -> bool {
        match self {
            Verb::Exec | Verb::Wait | Verb::Http | Verb::Https | Verb::Sleep => true,
            Verb::Service => cfg!(target_os = "windows"),
            Verb::Start => ctx == ActionContext::Start,
            Verb::Stop => ctx == ActionContext::Stop,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Exec => "exec",
            Verb::Wait => "wait",
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Http => "http",
            Verb::Https => "https",
            Verb::Sleep => "sleep",
            Verb::Service => "service",
        }
    }
}

/// One parsed action: `verb[,verb]*[:param][=expected]`.
///
/// The parameter is kept raw here; placeholder expansion happens right before
/// dispatch, against the owning sub-service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verbs: Vec<Verb>,
    pub param: String,
    pub expected: Option<i32>,
}

impl Action {
    /// Expected process exit status (default 0).
    pub fn expected_status(&self) -> i32 {
        self.expected.unwrap_or(0)
    }

    /// Expected HTTP status (default 200).
    pub fn expected_http_status(&self) -> i32 {
        self.expected.unwrap_or(200)
    }
}

/// Split an action string into its verb list, parameter and expected-result
/// suffix. Unknown and phase-disallowed verbs are silently dropped.
pub fn parse(raw: &str, ctx: ActionContext) -> Action {
    let (verbs_part, rest) = match raw.split_once(':') {
        Some((v, r)) => (v, Some(r)),
        None => (raw, None),
    };

    let verbs: Vec<Verb> = verbs_part
        .split(',')
        .map(str::trim)
        .filter_map(Verb::parse)
        .filter(|v| v.allowed_in(ctx))
        .collect();

    // A trailing `=NN` is an expected-result override; a non-integer suffix
    // is part of the parameter.
    let (param, expected) = match rest {
        None => (String::new(), None),
        Some(r) => match r.rsplit_once('=') {
            Some((p, suffix)) => match suffix.trim().parse::<i32>() {
                Ok(n) => (p.to_string(), Some(n)),
                Err(_) => (r.to_string(), None),
            },
            None => (r.to_string(), None),
        },
    };

    Action { verbs, param, expected }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_verb_has_empty_param() {
        let a = parse("start", ActionContext::Start);
        assert_eq!(a.verbs, vec![Verb::Start]);
        assert_eq!(a.param, "");
        assert_eq!(a.expected, None);
    }

    #[test]
    fn splits_at_first_colon_only() {
        let a = parse("http://127.0.0.1:8080/health=200", ActionContext::Watch);
        assert_eq!(a.verbs, vec![Verb::Http]);
        assert_eq!(a.param, "//127.0.0.1:8080/health");
        assert_eq!(a.expected, Some(200));
        assert_eq!(a.expected_http_status(), 200);
    }

    #[test]
    fn expected_suffix_defaults() {
        let a = parse("wait:/bin/check", ActionContext::Start);
        assert_eq!(a.expected, None);
        assert_eq!(a.expected_status(), 0);
        assert_eq!(a.expected_http_status(), 200);

        let a = parse("wait:/bin/check=3", ActionContext::Start);
        assert_eq!(a.expected, Some(3));
        assert_eq!(a.expected_status(), 3);
    }

    #[test]
    fn non_integer_suffix_stays_in_param() {
        let a = parse("exec:/bin/env NAME=value", ActionContext::Start);
        assert_eq!(a.param, "/bin/env NAME=value");
        assert_eq!(a.expected, None);
    }

    #[test]
    fn verb_list_is_ordered_and_filtered() {
        let a = parse("sleep,wait,exec:cmd", ActionContext::Start);
        assert_eq!(a.verbs, vec![Verb::Sleep, Verb::Wait, Verb::Exec]);

        // unknown verbs are dropped silently
        let a = parse("bogus,wait:cmd", ActionContext::Start);
        assert_eq!(a.verbs, vec![Verb::Wait]);
    }

    #[test]
    fn start_stop_verbs_are_phase_bound() {
        assert_eq!(parse("start", ActionContext::Stop).verbs, vec![]);
        assert_eq!(parse("stop", ActionContext::Start).verbs, vec![]);
        assert_eq!(parse("stop", ActionContext::Stop).verbs, vec![Verb::Stop]);
        assert_eq!(parse("start", ActionContext::Watch).verbs, vec![]);
        assert_eq!(parse("stop", ActionContext::Watch).verbs, vec![]);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn service_verb_is_windows_only() {
        assert_eq!(parse("service:spooler", ActionContext::Watch).verbs, vec![]);
    }

    #[test]
    fn negative_expected_status_parses() {
        let a = parse("wait:/bin/check=-1", ActionContext::Start);
        assert_eq!(a.expected, Some(-1));
    }
}
