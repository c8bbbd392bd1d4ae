//! Answer slots and the per-field parsing policy.
//!
//! Every structured sub-field of an answer record (`data`, `data.analysis_data`,
//! `reference`, `steps`, `label`) is decoded independently. A field that fails to
//! decode falls back to its empty value and leaves the others untouched.

use chatwire_core::{ChatId, MsgId, QueryId, RunId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::AnswerPayload;

/// A source link cited by an answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Display name.
    #[serde(default, deserialize_with = "or_default")]
    pub name: String,
    /// Target URL.
    #[serde(default, deserialize_with = "or_default")]
    pub url: String,
}

/// One entry of the reasoning trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStep {
    /// Pipeline node that produced the step.
    #[serde(default, deserialize_with = "or_default")]
    pub node: String,
    /// Step output.
    #[serde(default, deserialize_with = "or_default")]
    pub message: String,
    /// Thinking content, if any.
    #[serde(default)]
    pub thinking: Option<String>,
    /// Whether the step has finished.
    #[serde(default, deserialize_with = "or_default")]
    pub finished: bool,
}

/// A parameter the backend resolved from the question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParam {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    #[serde(default)]
    pub value: Value,
}

/// Parameters the backend resolved from the question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedParams {
    /// Resolved parameters in backend order.
    #[serde(default)]
    pub parameters: Vec<ResolvedParam>,
}

/// The `data` record of an answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisData {
    /// Stock series, JSON-encoded.
    #[serde(default, deserialize_with = "or_default")]
    pub analysis_data: String,
    /// Resolved query parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_params: Option<ResolvedParams>,
}

/// Metadata of a stock series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockMetadata {
    /// Symbols covered by the series.
    pub symbol: Vec<String>,
    /// Generation timestamp.
    pub generated_at: String,
    /// Question that produced the series.
    pub query: String,
    /// Bar width in seconds.
    pub time_granularity_seconds: u64,
    /// Human-readable bar width.
    pub time_granularity_label: String,
}

/// A stock series attached to an answer. Bars are passed through to the chart untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StockSeries {
    /// Series name.
    pub name: String,
    /// Series metadata.
    pub metadata: StockMetadata,
    /// Raw bars.
    pub data: Vec<Value>,
}

/// Mutable per-question record accumulating a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSlot {
    /// Correlation token.
    pub run_id: RunId,
    /// Outbound message that asked the question, for live slots.
    pub msg_id: Option<MsgId>,
    /// Owning conversation.
    pub chat_id: ChatId,
    /// Server-side question ID, known after the first frame.
    pub query_id: Option<QueryId>,
    /// The user's question.
    pub query: String,
    /// Accumulated thinking content.
    pub message: String,
    /// Answer text.
    pub response: String,
    /// Short summary.
    pub summary: String,
    /// Server timestamp.
    pub ts: String,
    /// Decoded `data` record.
    pub data: AnalysisData,
    /// Stock series decoded from `data.analysis_data`.
    pub stock_data: Vec<StockSeries>,
    /// Reasoning trace.
    pub steps: Vec<ChatStep>,
    /// Cited sources.
    pub references: Vec<Reference>,
    /// Labels.
    pub labels: Vec<String>,
    /// Whether the user collected the answer.
    pub is_collect: bool,
    /// Answer duration in milliseconds.
    pub message_time_long: u64,
    /// True until the run's `stream-end` is observed or the slot is expired locally.
    pub is_loading: bool,
    /// Whether the run was paused.
    pub is_paused: bool,
}

impl AnswerSlot {
    /// Create the optimistic placeholder for a question that was just submitted.
    #[must_use]
    pub fn pending(chat_id: ChatId, run_id: RunId, msg_id: MsgId, query: impl Into<String>) -> Self {
        Self {
            run_id,
            msg_id: Some(msg_id),
            chat_id,
            query_id: None,
            query: query.into(),
            message: String::new(),
            response: String::new(),
            summary: String::new(),
            ts: String::new(),
            data: AnalysisData::default(),
            stock_data: Vec::new(),
            steps: Vec::new(),
            references: Vec::new(),
            labels: Vec::new(),
            is_collect: false,
            message_time_long: 0,
            is_loading: true,
            is_paused: false,
        }
    }

    /// Build a completed slot from a history record.
    ///
    /// Records without a usable run ID get a fresh one so their content is kept; no
    /// live frame can match it.
    #[must_use]
    pub fn from_record(chat_id: ChatId, msg_id: Option<MsgId>, record: &AnswerPayload) -> Self {
        let run_id = record
            .run_id
            .as_deref()
            .and_then(|id| RunId::new(id).ok())
            .unwrap_or_else(RunId::generate);
        let query = record.query.clone().unwrap_or_default();

        let mut slot = Self::pending(chat_id, run_id, MsgId::generate(), query);
        slot.msg_id = msg_id;
        slot.apply(record);
        slot.complete();
        slot
    }

    /// Merge a snapshot into the slot.
    ///
    /// Frames carry full snapshots, not deltas: every field present in `payload`
    /// replaces the slot's value, absent fields are left alone. Never clears
    /// `is_loading`.
    pub fn apply(&mut self, payload: &AnswerPayload) {
        if let Some(query_id) = payload.query_id.as_deref().and_then(|q| QueryId::new(q).ok()) {
            self.query_id = Some(query_id);
        }
        if self.query.is_empty() {
            if let Some(query) = &payload.query {
                self.query.clone_from(query);
            }
        }
        if let Some(message) = &payload.message {
            self.message.clone_from(message);
        }
        if let Some(response) = &payload.response {
            self.response.clone_from(response);
        }
        if let Some(summary) = &payload.summary {
            self.summary.clone_from(summary);
        }
        if let Some(ts) = &payload.ts {
            self.ts.clone_from(ts);
        }
        if let Some(data) = &payload.data {
            self.data = decode_field("data", data);
            self.stock_data = decode_text("data.analysis_data", &self.data.analysis_data);
        }
        if let Some(reference) = &payload.reference {
            self.references = decode_field("reference", reference);
        }
        if let Some(steps) = &payload.steps {
            self.steps = decode_field("steps", steps);
        }
        if let Some(label) = &payload.label {
            self.labels = decode_field("label", label);
        }
        if let Some(is_collect) = &payload.is_collect {
            self.is_collect = truthy(is_collect);
        }
        if let Some(millis) = payload.message_time_long.as_ref().and_then(as_millis) {
            self.message_time_long = millis;
        }
        if let Some(is_paused) = &payload.is_paused {
            self.is_paused = truthy(is_paused);
        }
    }

    /// Mark the run finished: clears `is_loading` and closes every step.
    pub fn complete(&mut self) {
        self.is_loading = false;
        for step in &mut self.steps {
            step.finished = true;
        }
    }
}

/// Decode a sub-field sent either as a JSON string or as an inline value.
fn decode_field<T: DeserializeOwned + Default>(field: &'static str, value: &Value) -> T {
    match value {
        Value::String(text) => decode_text(field, text),
        Value::Null => T::default(),
        other => serde_json::from_value(other.clone()).unwrap_or_else(|e| {
            tracing::warn!(field, error = %e, "Failed to decode answer field, using empty value");
            T::default()
        }),
    }
}

fn decode_text<T: DeserializeOwned + Default>(field: &'static str, text: &str) -> T {
    if text.trim().is_empty() {
        return T::default();
    }
    match serde_json::from_str::<Option<T>>(text) {
        Ok(value) => value.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(field, error = %e, "Failed to decode answer field, using empty value");
            T::default()
        }
    }
}

/// `null` elements inside a list must not fail the whole list.
fn or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.as_str(), "1" | "true"),
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}

fn as_millis(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> AnswerPayload {
        serde_json::from_value(value).unwrap()
    }

    fn pending() -> AnswerSlot {
        AnswerSlot::pending(
            ChatId::new("chat-1").unwrap(),
            RunId::new("R1").unwrap(),
            MsgId::new("m-1").unwrap(),
            "gold price?",
        )
    }

    fn stock_json() -> String {
        json!([{
            "name": "AU",
            "metadata": {"symbol": ["AU2412"], "generated_at": "2024-10-01", "query": "gold",
                         "time_granularity_seconds": 86400, "time_granularity_label": "1d"},
            "data": [{"open": 1.0, "close": 2.0}]
        }])
        .to_string()
    }

    #[test]
    fn pending_slot_is_loading() {
        let slot = pending();
        assert!(slot.is_loading);
        assert!(slot.steps.is_empty());
        assert_eq!(slot.query, "gold price?");
    }

    #[test]
    fn apply_replaces_present_fields() {
        let mut slot = pending();
        slot.apply(&payload(json!({"message": "a", "response": "b", "queryId": "q-1"})));
        slot.apply(&payload(json!({"message": "a longer snapshot"})));

        assert_eq!(slot.message, "a longer snapshot");
        assert_eq!(slot.response, "b");
        assert_eq!(slot.query_id, Some(QueryId::new("q-1").unwrap()));
        assert!(slot.is_loading);
    }

    #[test]
    fn stock_data_decoded_from_nested_string() {
        let mut slot = pending();
        let data = json!({"analysis_data": stock_json()}).to_string();
        slot.apply(&payload(json!({ "data": data })));

        assert_eq!(slot.stock_data.len(), 1);
        assert_eq!(slot.stock_data[0].name, "AU");
        assert_eq!(slot.stock_data[0].metadata.symbol, vec!["AU2412"]);
        assert_eq!(slot.stock_data[0].data.len(), 1);
    }

    #[test]
    fn inline_data_object_is_accepted() {
        let mut slot = pending();
        slot.apply(&payload(json!({
            "data": {
                "analysis_data": stock_json(),
                "resolved_params": {"parameters": [{"name": "code", "value": "AU"}]}
            }
        })));

        assert_eq!(slot.stock_data.len(), 1);
        let params = slot.data.resolved_params.unwrap();
        assert_eq!(params.parameters[0].name, "code");
    }

    #[test]
    fn malformed_steps_reset_only_steps() {
        let mut slot = pending();
        let data = json!({"analysis_data": stock_json()}).to_string();
        let steps = json!([{"node": "search", "message": "ok", "thinking": null}]).to_string();
        slot.apply(&payload(json!({"message": "m", "data": data, "steps": steps})));
        assert_eq!(slot.steps.len(), 1);

        slot.apply(&payload(json!({"steps": "[{\"node\": "})));

        assert!(slot.steps.is_empty());
        assert_eq!(slot.stock_data.len(), 1);
        assert_eq!(slot.message, "m");
    }

    #[test]
    fn malformed_analysis_data_keeps_other_fields() {
        let mut slot = pending();
        let data = json!({"analysis_data": "not json"}).to_string();
        let reference = json!([{"name": "SHFE", "url": "https://shfe.com.cn"}]).to_string();
        slot.apply(&payload(json!({"data": data, "reference": reference, "label": "[\"gold\"]"})));

        assert!(slot.stock_data.is_empty());
        assert_eq!(slot.references[0].name, "SHFE");
        assert_eq!(slot.labels, vec!["gold"]);
    }

    #[test]
    fn null_scalars_keep_every_element() {
        let mut slot = pending();
        let steps = json!([
            {"node": "search", "message": "ok", "thinking": null},
            {"node": "plan", "message": null, "thinking": null, "finished": null}
        ])
        .to_string();
        let reference = json!([{"name": "a", "url": "u"}, {"name": null, "url": "v"}]).to_string();
        slot.apply(&payload(json!({"steps": steps, "reference": reference})));

        assert_eq!(slot.steps.len(), 2);
        assert_eq!(slot.steps[1].node, "plan");
        assert_eq!(slot.steps[1].message, "");
        assert!(!slot.steps[1].finished);
        assert_eq!(slot.references.len(), 2);
        assert_eq!(slot.references[1].name, "");
        assert_eq!(slot.references[1].url, "v");
    }

    #[test]
    fn complete_finishes_steps() {
        let mut slot = pending();
        slot.apply(&payload(json!({"steps": [{"node": "plan", "message": "", "finished": false}]})));
        assert!(!slot.steps[0].finished);

        slot.complete();
        assert!(!slot.is_loading);
        assert!(slot.steps[0].finished);
    }

    #[test]
    fn history_record_builds_completed_slot() {
        let record = payload(json!({
            "runId": "R9",
            "queryId": "q-9",
            "query": "silver?",
            "response": "up",
            "isCollect": 1,
            "messageTimeLong": 1200,
            "isPaused": false,
            "steps": "[{\"node\":\"n\",\"message\":\"m\",\"thinking\":null}]",
            "reference": "",
            "label": null
        }));
        let slot = AnswerSlot::from_record(ChatId::new("c").unwrap(), None, &record);

        assert_eq!(slot.run_id.as_str(), "R9");
        assert_eq!(slot.query, "silver?");
        assert!(!slot.is_loading);
        assert!(slot.is_collect);
        assert_eq!(slot.message_time_long, 1200);
        assert!(slot.steps.iter().all(|s| s.finished));
        assert!(slot.references.is_empty());
    }

    #[test]
    fn history_record_without_run_id_gets_fresh_id() {
        let slot = AnswerSlot::from_record(
            ChatId::new("c").unwrap(),
            None,
            &payload(json!({"response": "old"})),
        );
        assert_eq!(slot.run_id.as_str().len(), chatwire_core::GENERATED_ID_LEN);
        assert_eq!(slot.response, "old");
    }
}
