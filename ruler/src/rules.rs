//! Rules: the typed rule model, the immutable rule store and its
//! atomic snapshot handle, condition resolution, and alert message
//! formatting.

use std::sync::LazyLock;

use arc_swap::ArcSwap;
use kube::ResourceExt;
use regex::Regex;
use strum::{Display, EnumString};

use api::v1alpha1::{ClusterRuleGroup, ExprSpec, RuleSpec};

use crate::prelude::*;
use crate::record::{Auditing, KubeEvent};

/// PLACEHOLDER matches the `${...}` references inside conditions and
/// message format strings.
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("static pattern compiles"));

/// CONDITION_SIZE_CAP bounds condition expansion; blowing past it
/// means the references do not converge.
const CONDITION_SIZE_CAP: usize = 1 << 16;

/// AUDIT_IDENTITY_KEY is the flattened field `${$N}` captures index
/// into for auditing records.
const AUDIT_IDENTITY_KEY: &str = "ObjectRef.Name";

/// EVENT_IDENTITY_KEY is the flattened field `${$N}` captures index
/// into for event records.
const EVENT_IDENTITY_KEY: &str = "involvedObject.name";

/// RESOURCES_IN_WORKSPACE are the resources whose default alert
/// message is phrased against the workspace rather than a namespace.
const RESOURCES_IN_WORKSPACE: [&str; 6] = [
    "devops",
    "namespaces",
    "federatednamespaces",
    "workspaceroles",
    "federatedworkspaceroles",
    "workspacemembers",
];

/// Severity orders alerts. Parsing is forgiving: anything outside
/// the four known names ranks below `INFO`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Unset or unrecognized.
    #[default]
    Unknown,
    /// `INFO`
    Info,
    /// `WARNING`
    Warning,
    /// `ERROR`
    Error,
    /// `CRITICAL`
    Critical,
}

impl Severity {
    /// Parse maps the CRD severity string onto the ordered enum.
    pub fn parse(s: &str) -> Severity {
        match s {
            "INFO" => Severity::Info,
            "WARNING" => Severity::Warning,
            "ERROR" => Severity::Error,
            "CRITICAL" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }

    /// As_str is the CRD spelling; `Unknown` renders empty.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// EventType selects which pipeline a rule group applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EventType {
    /// Audit entries.
    Auditing,
    /// Cluster events.
    Events,
    /// Log lines; parsed but no pipeline ingests them today.
    Logging,
}

/// Expr is the typed rule expression. Only `Rule` can fire; the
/// others are reusable fragments conditions splice in.
#[derive(Clone, Debug)]
pub enum Expr {
    /// An evaluable condition.
    Rule {
        /// The raw condition, possibly containing `${...}` references.
        condition: String,
    },
    /// A condition fragment spliced in verbatim.
    Macro {
        /// The fragment text.
        text: String,
    },
    /// Another name for a record field.
    Alias {
        /// The field the alias stands for.
        target: String,
    },
    /// A literal list, rendered as `("a","b",...)`.
    List {
        /// The elements, in declared order.
        items: Vec<String>,
    },
}

impl Expr {
    fn from_spec(spec: &ExprSpec) -> Option<Expr> {
        match spec.kind.as_str() {
            "rule" => Some(Expr::Rule {
                condition: spec.condition.clone(),
            }),
            "macro" => Some(Expr::Macro {
                text: spec.macro_text.clone(),
            }),
            "alias" => Some(Expr::Alias {
                target: spec.alias.clone(),
            }),
            "list" => Some(Expr::List {
                items: spec.list.clone(),
            }),
            _ => None,
        }
    }
}

/// Segment is one piece of a parsed format string.
#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Field(String),
    Positional(usize),
}

/// Template is a pre-parsed alert format string: literal text with
/// `${field}` substitutions (one level of alias indirection) and
/// `${$N}` positional captures over the record's identity field.
#[derive(Clone, Debug, Default)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse splits `text` into literal and substitution segments.
    pub fn parse(text: &str) -> Template {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let m = caps.get(0).expect("group 0 always present");
            if m.start() > last {
                segments.push(Segment::Literal(text[last..m.start()].to_string()));
            }
            let name = caps.get(1).map(|g| g.as_str()).unwrap_or_default();
            if let Some(n) = name.strip_prefix('$') {
                match n.parse::<usize>() {
                    Ok(n) if n > 0 => segments.push(Segment::Positional(n)),
                    _ => {
                        warn!(capture = %name, "bad positional capture in format string");
                        segments.push(Segment::Literal(String::new()));
                    }
                }
            } else {
                segments.push(Segment::Field(name.to_string()));
            }
            last = m.end();
        }
        if last < text.len() {
            segments.push(Segment::Literal(text[last..].to_string()));
        }
        Template { segments }
    }

    /// Is_empty reports whether the format string was empty.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render substitutes against the flattened record.
    fn render(
        &self,
        flat: &Map<String, Value>,
        store: &RuleStore,
        group: &str,
        identity_key: &str,
    ) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(field) => {
                    let key = store.alias_target(group, field);
                    out.push_str(&scalar_text(flat.get(key.as_str())));
                }
                Segment::Positional(n) => {
                    let identity = scalar_text(flat.get(identity_key));
                    out.push_str(identity.split(':').nth(n - 1).unwrap_or_default());
                }
            }
        }
        out
    }
}

fn scalar_text(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
    }
}

/// Rule is one loaded entry: a firing rule or a macro/list/alias
/// fragment, tagged with its group and event type.
#[derive(Clone, Debug)]
pub struct Rule {
    /// Rule name within its group.
    pub name: String,
    /// Name of the group (the ClusterRuleGroup) this rule is in.
    pub group: String,
    /// Whether the rule is evaluated.
    pub enable: bool,
    /// Pipeline the rule applies to; `None` when the group type was
    /// unrecognized (such a rule can never match).
    pub event_type: Option<EventType>,
    /// Alert severity.
    pub severity: Severity,
    /// The expression.
    pub expr: Expr,
    message: Template,
    annotations: Vec<(String, Template)>,
}

impl Rule {
    /// Qualified_name is the store key, `<group>.<name>`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }

    /// Auditing_alert formats the message and annotations for a
    /// fired auditing record.
    pub fn auditing_alert(
        &self,
        a: &Auditing,
        flat: &Map<String, Value>,
        store: &RuleStore,
    ) -> (String, BTreeMap<String, String>) {
        let msg = if self.message.is_empty() {
            default_auditing_message(a)
        } else {
            self.message.render(flat, store, &self.group, AUDIT_IDENTITY_KEY)
        };
        (msg, self.render_annotations(flat, store, AUDIT_IDENTITY_KEY))
    }

    /// Event_alert formats the message and annotations for a fired
    /// event record. With no format string configured the event's
    /// own message is used.
    pub fn event_alert(
        &self,
        e: &KubeEvent,
        flat: &Map<String, Value>,
        store: &RuleStore,
    ) -> (String, BTreeMap<String, String>) {
        let msg = if self.message.is_empty() {
            e.event.message.clone().unwrap_or_default()
        } else {
            self.message.render(flat, store, &self.group, EVENT_IDENTITY_KEY)
        };
        (msg, self.render_annotations(flat, store, EVENT_IDENTITY_KEY))
    }

    fn render_annotations(
        &self,
        flat: &Map<String, Value>,
        store: &RuleStore,
        identity_key: &str,
    ) -> BTreeMap<String, String> {
        self.annotations
            .iter()
            .map(|(k, t)| (k.clone(), t.render(flat, store, &self.group, identity_key)))
            .collect()
    }
}

/// Default_auditing_message is the message used when a rule carries
/// no format string: `<user> <verb> <resource> '<name>'`, suffixed
/// with the workspace, devops project or namespace it happened in.
fn default_auditing_message(a: &Auditing) -> String {
    let oref = a.event.object_ref.clone().unwrap_or_default();
    let head = format!(
        "{} {} {} '{}'",
        a.event.user.username, a.event.verb, oref.resource, oref.name
    );
    if !a.workspace.is_empty() && RESOURCES_IN_WORKSPACE.contains(&oref.resource.as_str()) {
        format!("{head} in Workspace {}", a.workspace)
    } else if !a.devops.is_empty() {
        format!("{head} in Devops {}", a.devops)
    } else if !oref.namespace.is_empty()
        && oref.resource != "namespaces"
        && oref.resource != "federatednamespaces"
    {
        format!("{head} in Namespace {}", oref.namespace)
    } else {
        head
    }
}

/// RuleStore is an immutable snapshot of the loaded rule set, keyed
/// by `<group>.<name>`. Iteration order is the key order, which
/// makes the matcher deterministic.
#[derive(Clone, Debug, Default)]
pub struct RuleStore {
    rules: BTreeMap<String, Rule>,
}

impl RuleStore {
    /// Load builds a store from the current rule groups, then prunes
    /// every `rule`-kind entry whose condition cannot be resolved or
    /// does not parse. The survivors are guaranteed evaluable.
    pub fn load<I>(groups: I) -> RuleStore
    where
        I: IntoIterator<Item = Arc<ClusterRuleGroup>>,
    {
        let mut rules = BTreeMap::new();
        for group in groups {
            let group_name = group.name_any();
            if group_name.is_empty() {
                warn!("skipping rule group without a name");
                continue;
            }
            let event_type = match group.spec.group_type.parse::<EventType>() {
                Ok(t) => Some(t),
                Err(_) => {
                    warn!(
                        group = group_name,
                        kind = group.spec.group_type,
                        "unrecognized group type, its rules will never match"
                    );
                    None
                }
            };
            for spec in &group.spec.rules {
                match load_rule(&group_name, event_type, spec) {
                    Some(rule) => {
                        rules.insert(rule.qualified_name(), rule);
                    }
                    None => warn!(
                        group = group_name,
                        rule = spec.name,
                        kind = spec.expr.kind,
                        "skipping rule with unrecognized expression kind"
                    ),
                }
            }
        }

        let mut store = RuleStore { rules };
        store.prune();
        store
    }

    fn prune(&mut self) {
        let mut bad = Vec::new();
        for (name, rule) in &self.rules {
            if !matches!(rule.expr, Expr::Rule { .. }) {
                continue;
            }
            let cond = match self.resolve_condition(rule) {
                Ok(cond) => cond,
                Err(err) => {
                    error!(rule = %name, %err, "dropping rule");
                    bad.push(name.clone());
                    continue;
                }
            };
            if let Err(err) = rule_dsl::check(&cond) {
                error!(rule = %name, condition = %cond, %err, "dropping rule with malformed condition");
                bad.push(name.clone());
            }
        }
        for name in bad {
            self.rules.remove(&name);
        }
    }

    /// Get looks `ident` up qualified by `group` first, then bare.
    pub fn get(&self, group: &str, ident: &str) -> Option<&Rule> {
        self.rules
            .get(&format!("{group}.{ident}"))
            .or_else(|| self.rules.get(ident))
    }

    /// Iter walks the rules in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Len reports the number of loaded rules of any kind.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Is_empty reports whether the store holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve_condition expands every `${...}` reference in the
    /// rule's condition until none remain, then returns the
    /// self-contained condition. Expansion runs at most one pass per
    /// loaded rule and is size-capped, so reference cycles fail
    /// instead of spinning.
    pub fn resolve_condition(&self, rule: &Rule) -> Result<String> {
        let Expr::Rule { condition } = &rule.expr else {
            return Err(Error::InvalidRule(format!(
                "rule {}: only rule kinds have conditions",
                rule.name
            )));
        };
        let mut cond = condition.clone();
        for _ in 0..self.rules.len().max(1) {
            if !PLACEHOLDER.is_match(&cond) {
                return Ok(cond);
            }
            cond = self.expand_once(rule, &cond)?;
            if cond.len() > CONDITION_SIZE_CAP {
                return Err(Error::InvalidRule(format!(
                    "rule {}: condition expansion exceeded {CONDITION_SIZE_CAP} bytes",
                    rule.name
                )));
            }
        }
        if PLACEHOLDER.is_match(&cond) {
            return Err(Error::InvalidRule(format!(
                "rule {}: condition references did not converge",
                rule.name
            )));
        }
        Ok(cond)
    }

    fn expand_once(&self, rule: &Rule, cond: &str) -> Result<String> {
        let mut out = String::with_capacity(cond.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(cond) {
            let m = caps.get(0).expect("group 0 always present");
            out.push_str(&cond[last..m.start()]);
            let ident = caps.get(1).map(|g| g.as_str()).unwrap_or_default();
            let referenced = self.get(&rule.group, ident).ok_or_else(|| {
                Error::InvalidRule(format!("rule {}: {} not found", rule.name, ident))
            })?;
            match &referenced.expr {
                Expr::Macro { text } => out.push_str(text),
                Expr::Alias { target } => out.push_str(target),
                Expr::List { items } => {
                    out.push('(');
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        out.push('"');
                        out.push_str(item);
                        out.push('"');
                    }
                    out.push(')');
                }
                Expr::Rule { .. } => {
                    return Err(Error::InvalidRule(format!(
                        "rule {}: {} does not name a macro, list or alias",
                        rule.name, ident
                    )));
                }
            }
            last = m.end();
        }
        out.push_str(&cond[last..]);
        Ok(out)
    }

    /// Alias_target resolves one level of alias indirection for a
    /// message field: `<group>.<field>` first, then bare, and only
    /// if the hit is an alias.
    fn alias_target(&self, group: &str, field: &str) -> String {
        let alias = |r: &&Rule| matches!(r.expr, Expr::Alias { .. });
        self.rules
            .get(&format!("{group}.{field}"))
            .filter(alias)
            .or_else(|| self.rules.get(field).filter(alias))
            .map(|r| match &r.expr {
                Expr::Alias { target } => target.clone(),
                _ => unreachable!(),
            })
            .unwrap_or_else(|| field.to_string())
    }
}

fn load_rule(group: &str, event_type: Option<EventType>, spec: &RuleSpec) -> Option<Rule> {
    let expr = Expr::from_spec(&spec.expr)?;
    Some(Rule {
        name: spec.name.clone(),
        group: group.to_string(),
        enable: spec.enable,
        event_type,
        severity: Severity::parse(&spec.alerts.severity),
        expr,
        message: Template::parse(&spec.alerts.message),
        annotations: spec
            .alerts
            .annotations
            .iter()
            .map(|(k, v)| (k.clone(), Template::parse(v)))
            .collect(),
    })
}

/// StoreHandle is the atomic snapshot pointer the single writer (the
/// config loader) publishes through and every worker reads from. A
/// snapshot taken at the start of a match is used for the whole
/// match.
#[derive(Clone, Default)]
pub struct StoreHandle(Arc<ArcSwap<RuleStore>>);

impl StoreHandle {
    /// Snapshot returns the current store.
    pub fn snapshot(&self) -> Arc<RuleStore> {
        self.0.load_full()
    }

    /// Replace atomically publishes a new store.
    pub fn replace(&self, store: RuleStore) {
        self.0.store(Arc::new(store));
    }
}
