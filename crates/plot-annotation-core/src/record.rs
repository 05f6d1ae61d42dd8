use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Logical attributes read from a schema-less plot record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    ExplicitId,
    Title,
    Genre,
    Status,
    Seed,
    Method,
}

impl Attribute {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExplicitId => "explicit_id",
            Self::Title => "title",
            Self::Genre => "genre",
            Self::Status => "status",
            Self::Seed => "seed",
            Self::Method => "method",
        }
    }
}

/// Which values count as "present" when walking a fallback chain.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Presence {
    /// Any non-null value wins.
    NonNull,
    /// Null, `""`, `false`, `0`, `[]` and `{}` are skipped.
    NonEmpty,
}

/// Ordered field-name fallbacks for one logical attribute.
#[derive(Debug, Clone, Copy)]
pub struct FieldChain {
    pub attribute: Attribute,
    pub fields: &'static [&'static str],
    pub presence: Presence,
}

/// Resolution table, evaluated left to right; the first present field wins.
pub static FIELD_CHAINS: [FieldChain; 6] = [
    FieldChain {
        attribute: Attribute::ExplicitId,
        fields: &["plot_id", "id", "uuid"],
        presence: Presence::NonEmpty,
    },
    FieldChain { attribute: Attribute::Title, fields: &["title"], presence: Presence::NonNull },
    FieldChain { attribute: Attribute::Genre, fields: &["genre"], presence: Presence::NonNull },
    FieldChain { attribute: Attribute::Status, fields: &["status"], presence: Presence::NonNull },
    FieldChain {
        attribute: Attribute::Seed,
        fields: &["seed_id", "seed"],
        presence: Presence::NonNull,
    },
    FieldChain {
        attribute: Attribute::Method,
        fields: &["method_name", "method", "system"],
        presence: Presence::NonNull,
    },
];

const IDENTITY_SEPARATOR: &str = "||";

#[must_use]
pub fn chain_for(attribute: Attribute) -> &'static FieldChain {
    // FIELD_CHAINS holds exactly one chain per attribute, in declaration order.
    let index = match attribute {
        Attribute::ExplicitId => 0,
        Attribute::Title => 1,
        Attribute::Genre => 2,
        Attribute::Status => 3,
        Attribute::Seed => 4,
        Attribute::Method => 5,
    };
    &FIELD_CHAINS[index]
}

fn is_present(value: &Value, presence: Presence) -> bool {
    match (presence, value) {
        (_, Value::Null) => false,
        (Presence::NonNull, _) => true,
        (Presence::NonEmpty, Value::Bool(flag)) => *flag,
        (Presence::NonEmpty, Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        (Presence::NonEmpty, Value::String(text)) => !text.is_empty(),
        (Presence::NonEmpty, Value::Array(items)) => !items.is_empty(),
        (Presence::NonEmpty, Value::Object(map)) => !map.is_empty(),
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0));
            Value::Object(entries.into_iter().map(|(key, v)| (key.clone(), canonical(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Render a field value as plain text. Nested values use key-sorted compact JSON so the
/// rendering does not depend on source field order.
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        nested => canonical(nested).to_string(),
    }
}

/// One uploaded plot. Field order of the source document is preserved; nothing in the
/// kernel mutates a record after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct PlotRecord(Map<String, Value>);

impl PlotRecord {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accept any JSON value that is an object; everything else is not a plot record.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Walk the attribute's fallback chain. Returns `None` when no field is present.
    #[must_use]
    pub fn resolve(&self, attribute: Attribute) -> Option<String> {
        let chain = chain_for(attribute);
        chain
            .fields
            .iter()
            .filter_map(|field| self.0.get(*field))
            .find(|value| is_present(value, chain.presence))
            .map(value_text)
    }

    /// Like [`PlotRecord::resolve`] with missing values rendered as the empty string.
    #[must_use]
    pub fn text(&self, attribute: Attribute) -> String {
        self.resolve(attribute).unwrap_or_default()
    }

    #[must_use]
    pub fn plot_id(&self) -> String {
        identity(self)
    }

    #[must_use]
    pub fn title(&self) -> String {
        self.text(Attribute::Title)
    }

    #[must_use]
    pub fn genre(&self) -> String {
        self.text(Attribute::Genre)
    }

    #[must_use]
    pub fn status(&self) -> String {
        self.text(Attribute::Status)
    }

    #[must_use]
    pub fn seed(&self) -> String {
        self.text(Attribute::Seed)
    }

    #[must_use]
    pub fn method(&self) -> String {
        self.text(Attribute::Method)
    }

    /// The causal graph, either embedded as an object or stored as a JSON string.
    #[must_use]
    pub fn causal_graph(&self) -> Option<Value> {
        match self.0.get("causal_graph")? {
            Value::String(raw) => serde_json::from_str::<Value>(raw).ok(),
            Value::Null => None,
            embedded => Some(embedded.clone()),
        }
    }

    #[must_use]
    pub fn graph_shape(&self) -> Option<GraphShape> {
        let graph = self.causal_graph()?;
        let graph = graph.as_object()?;
        let count = |key: &str| graph.get(key).and_then(Value::as_array).map_or(0, Vec::len);
        Some(GraphShape { event_nodes: count("event_nodes"), edges: count("edges") })
    }

    #[must_use]
    pub fn summary(&self, index: usize, is_gold: bool) -> PlotSummary {
        PlotSummary {
            index,
            plot_id: self.plot_id(),
            title: self.title(),
            genre: self.genre(),
            status: self.status(),
            seed_id: self.seed(),
            method: self.method(),
            is_gold,
            graph: self.graph_shape(),
        }
    }
}

/// Canonical identity of a plot record.
///
/// The first non-empty explicit identifier (`plot_id`, `id`, `uuid`) wins; otherwise the
/// key is `title||seed||method`, with each missing component rendered as `""`.
#[must_use]
pub fn identity(record: &PlotRecord) -> String {
    if let Some(explicit) = record.resolve(Attribute::ExplicitId) {
        return explicit;
    }

    [record.title(), record.seed(), record.method()].join(IDENTITY_SEPARATOR)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct GraphShape {
    pub event_nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlotSummary {
    pub index: usize,
    pub plot_id: String,
    pub title: String,
    pub genre: String,
    pub status: String,
    pub seed_id: String,
    pub method: String,
    pub is_gold: bool,
    pub graph: Option<GraphShape>,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> PlotRecord {
        match PlotRecord::from_value(value) {
            Some(record) => record,
            None => panic!("fixture must be a JSON object"),
        }
    }

    #[test]
    fn explicit_identifier_takes_precedence_in_chain_order() {
        let plot = record(json!({"uuid": "u-1", "id": "i-1", "plot_id": "p-1", "title": "T"}));
        assert_eq!(identity(&plot), "p-1");

        let plot = record(json!({"uuid": "u-1", "id": "i-1", "title": "T"}));
        assert_eq!(identity(&plot), "i-1");

        let plot = record(json!({"uuid": "u-1", "title": "T"}));
        assert_eq!(identity(&plot), "u-1");
    }

    #[test]
    fn empty_explicit_identifiers_fall_through() {
        let plot = record(json!({
            "plot_id": "",
            "id": null,
            "uuid": 0,
            "title": "Storm",
            "seed_id": "s1",
            "method_name": "baseline"
        }));
        assert_eq!(identity(&plot), "Storm||s1||baseline");
    }

    #[test]
    fn numeric_identifier_renders_as_text() {
        let plot = record(json!({"id": 42, "title": "ignored"}));
        assert_eq!(identity(&plot), "42");
    }

    #[test]
    fn composite_identity_uses_fallback_fields() {
        let plot = record(json!({"title": "Storm", "seed": 7, "system": "planner"}));
        assert_eq!(identity(&plot), "Storm||7||planner");

        let plot = record(json!({"title": "Storm", "method": "m", "method_name": "mn"}));
        assert_eq!(identity(&plot), "Storm||||mn");
    }

    #[test]
    fn null_fields_are_skipped_but_empty_strings_win_for_metadata() {
        let plot = record(json!({"title": "A", "seed_id": null, "seed": "s2", "method_name": ""}));
        assert_eq!(plot.seed(), "s2");
        assert_eq!(plot.method(), "");
        assert_eq!(identity(&plot), "A||s2||");
    }

    #[test]
    fn record_without_any_known_field_has_separator_only_identity() {
        let plot = record(json!({"unrelated": true}));
        assert_eq!(identity(&plot), "||||");
    }

    #[test]
    fn field_chains_cover_every_attribute_once() {
        for attribute in [
            Attribute::ExplicitId,
            Attribute::Title,
            Attribute::Genre,
            Attribute::Status,
            Attribute::Seed,
            Attribute::Method,
        ] {
            assert_eq!(chain_for(attribute).attribute, attribute, "{}", attribute.as_str());
        }
    }

    #[test]
    fn causal_graph_accepts_embedded_and_encoded_forms() {
        let embedded = record(json!({
            "causal_graph": {"event_nodes": [{"id": "e1"}, {"id": "e2"}], "edges": [{"from": "e1", "to": "e2"}]}
        }));
        assert_eq!(embedded.graph_shape(), Some(GraphShape { event_nodes: 2, edges: 1 }));

        let encoded = record(json!({
            "causal_graph": "{\"event_nodes\": [{\"id\": \"e1\"}], \"edges\": []}"
        }));
        assert_eq!(encoded.graph_shape(), Some(GraphShape { event_nodes: 1, edges: 0 }));

        let broken = record(json!({"causal_graph": "{not json"}));
        assert_eq!(broken.graph_shape(), None);
        assert_eq!(record(json!({})).graph_shape(), None);
    }

    #[test]
    fn summary_reports_resolved_metadata() {
        let plot = record(json!({
            "title": "Harbor",
            "genre": "noir",
            "status": "final",
            "seed": "s9",
            "method": "tree-search"
        }));
        let summary = plot.summary(3, true);
        assert_eq!(summary.index, 3);
        assert_eq!(summary.plot_id, "Harbor||s9||tree-search");
        assert_eq!(summary.genre, "noir");
        assert!(summary.is_gold);
        assert_eq!(summary.graph, None);
    }

    proptest! {
        #[test]
        fn identity_is_independent_of_field_order(
            title in "[a-zA-Z ]{0,12}",
            seed in "[a-z0-9]{0,6}",
            method in "[a-z_]{0,8}",
            rotation in 0_usize..5,
        ) {
            let mut fields = vec![
                ("title".to_string(), Value::String(title)),
                ("seed_id".to_string(), Value::String(seed)),
                ("method_name".to_string(), Value::String(method)),
                ("genre".to_string(), Value::String("drama".to_string())),
                ("meta".to_string(), json!({"b": 1, "a": [2, 3]})),
            ];
            let forward = PlotRecord::new(fields.iter().cloned().collect());
            fields.rotate_left(rotation);
            fields.reverse();
            let shuffled = PlotRecord::new(fields.into_iter().collect());

            prop_assert_eq!(identity(&forward), identity(&forward));
            prop_assert_eq!(identity(&forward), identity(&shuffled));
        }
    }
}
