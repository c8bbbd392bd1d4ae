//! Typed REST calls for chats, history and collections.

use chatwire_core::{ChatId, MsgId, QueryId};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::http::{ApiClient, CallOptions, Envelope};
use crate::protocol::AnswerPayload;

/// REST paths relative to the API base URL.
pub mod paths {
    /// Paged chat list.
    pub const CHAT_LIST: &str = "/buyer/chat/list";
    /// Paged message history of a chat.
    pub const MESSAGE_LIST: &str = "/buyer/chat/message/list";
    /// Create a chat.
    pub const ADD_CHAT: &str = "/buyer/chat/add";
    /// Rename a chat.
    pub const UPDATE_CHAT: &str = "/buyer/chat/update";
    /// Delete a chat.
    pub const DELETE_CHAT: &str = "/buyer/chat/delete";
    /// Collect an answer.
    pub const ADD_COLLECT: &str = "/buyer/chat/collect/add";
    /// Un-collect an answer.
    pub const CANCEL_COLLECT: &str = "/buyer/chat/collect/cancel";
}

/// Sort direction of a paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Common paging parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    /// Search keyword.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    /// Page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// 1-based page number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    /// Sort field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    /// Sort direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,
}

impl PageQuery {
    /// Request page `number` with `size` entries.
    #[must_use]
    pub fn page(number: u32, size: u32) -> Self {
        Self {
            page_number: Some(number),
            page_size: Some(size),
            ..Self::default()
        }
    }
}

/// Body of the chat list call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListQuery {
    /// Owner of the chats.
    pub user_id: String,
    /// Paging.
    #[serde(flatten)]
    pub page: PageQuery,
}

/// Body of the message history call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// Owner of the chat.
    pub user_id: String,
    /// Chat to load; all chats when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    /// Paging.
    #[serde(flatten)]
    pub page: PageQuery,
}

/// One page of a paged result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Page<T> {
    /// Current page number.
    #[serde(default)]
    pub current: u64,
    /// Total number of pages.
    #[serde(default)]
    pub pages: u64,
    /// Page size.
    #[serde(default)]
    pub size: u64,
    /// Total number of records.
    #[serde(default)]
    pub total: u64,
    /// Records on this page.
    #[serde(default = "Vec::new")]
    pub records: Vec<T>,
}

/// A conversation as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Chat ID.
    pub chat_id: ChatId,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Owner.
    #[serde(default)]
    pub user_id: String,
    /// Creation time, `YYYY/MM/DD HH:mm:ss` or `YYYY-MM-DD HH:mm:ss`.
    #[serde(default)]
    pub create_time: String,
    /// Last update time, same formats as `create_time`.
    #[serde(default)]
    pub update_time: String,
}

/// One question of a history page with the answers recorded for it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    /// Owning chat.
    #[serde(default)]
    pub chat_id: String,
    /// The question.
    #[serde(default)]
    pub query: String,
    /// Message ID of the question.
    #[serde(default)]
    pub msg_id: String,
    /// Raw answer records, decoded with the same per-field policy as live frames.
    #[serde(default)]
    pub chat_query_answer_list: Vec<AnswerPayload>,
}

impl HistoryMessage {
    /// Message ID, if the server sent a usable one.
    #[must_use]
    pub fn msg_id(&self) -> Option<MsgId> {
        MsgId::new(self.msg_id.as_str()).ok()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateChatRequest<'a> {
    chat_id: &'a ChatId,
    title: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRef<'a> {
    chat_id: &'a ChatId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRef<'a> {
    query_id: &'a QueryId,
}

impl ApiClient {
    // =========================================================================
    // Chats
    // =========================================================================

    /// List chats, newest first.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn chat_list(&self, query: &ChatListQuery) -> Result<Envelope<Page<Chat>>> {
        self.post(paths::CHAT_LIST, query, CallOptions::new()).await
    }

    /// Create a chat.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn add_chat(&self, title: Option<&str>) -> Result<Envelope<Chat>> {
        self.post(paths::ADD_CHAT, &AddChatRequest { title }, CallOptions::new())
            .await
    }

    /// Rename a chat.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn update_chat(&self, chat_id: &ChatId, title: &str) -> Result<Envelope<Chat>> {
        let request = UpdateChatRequest { chat_id, title };
        self.post(paths::UPDATE_CHAT, &request, CallOptions::new()).await
    }

    /// Delete a chat.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn delete_chat(&self, chat_id: &ChatId) -> Result<Envelope<bool>> {
        self.post(paths::DELETE_CHAT, &ChatRef { chat_id }, CallOptions::new())
            .await
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Load a page of message history.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn message_history(&self, query: &HistoryQuery) -> Result<Envelope<Page<HistoryMessage>>> {
        self.post(paths::MESSAGE_LIST, query, CallOptions::new()).await
    }

    // =========================================================================
    // Collections
    // =========================================================================

    /// Collect an answer.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn add_collect(&self, query_id: &QueryId) -> Result<Envelope<bool>> {
        self.post(paths::ADD_COLLECT, &QueryRef { query_id }, CallOptions::new())
            .await
    }

    /// Remove an answer from the collection.
    ///
    /// # Errors
    ///
    /// See [`ApiClient::call`].
    pub async fn cancel_collect(&self, query_id: &QueryId) -> Result<Envelope<bool>> {
        self.post(paths::CANCEL_COLLECT, &QueryRef { query_id }, CallOptions::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::config::TransportConfig;
    use crate::notice::LogNotifier;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        let config = TransportConfig {
            api_base_url: server.uri(),
            retry_count: 0,
            ..TransportConfig::default()
        };
        ApiClient::new(&config, Arc::new(StaticToken::new("tok")), Arc::new(LogNotifier)).unwrap()
    }

    #[test]
    fn history_query_flattens_paging() {
        let query = HistoryQuery {
            user_id: "u-1".into(),
            chat_id: Some(ChatId::new("c-1").unwrap()),
            page: PageQuery::page(2, 20),
        };
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"userId": "u-1", "chatId": "c-1", "pageNumber": 2, "pageSize": 20})
        );
    }

    #[tokio::test]
    async fn chat_list_decodes_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(paths::CHAT_LIST))
            .and(body_json(json!({"userId": "u-1", "pageNumber": 1, "pageSize": 10})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "",
                "result": {
                    "current": 1, "pages": 1, "size": 10, "total": 1,
                    "records": [{
                        "chatId": "c-1", "title": "gold", "userId": "u-1",
                        "createTime": "2024/10/01 08:00:00", "updateTime": "2024/10/02 09:30:00"
                    }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let query = ChatListQuery {
            user_id: "u-1".into(),
            page: PageQuery::page(1, 10),
        };
        let page = client(&server).chat_list(&query).await.unwrap().result.unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].chat_id.as_str(), "c-1");
        assert_eq!(page.records[0].update_time, "2024/10/02 09:30:00");
    }

    #[tokio::test]
    async fn message_history_keeps_raw_answer_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(paths::MESSAGE_LIST))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "message": "",
                "result": {
                    "records": [{
                        "chatId": "c-1", "query": "gold?", "msgId": "",
                        "chatQueryAnswerList": [{
                            "runId": "R1", "response": "up", "steps": "[]", "isCollect": 0
                        }]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let query = HistoryQuery {
            user_id: "u-1".into(),
            chat_id: Some(ChatId::new("c-1").unwrap()),
            page: PageQuery::default(),
        };
        let page = client(&server).message_history(&query).await.unwrap().result.unwrap();

        let message = &page.records[0];
        assert_eq!(message.msg_id(), None);
        assert_eq!(message.chat_query_answer_list[0].run_id.as_deref(), Some("R1"));
        assert_eq!(message.chat_query_answer_list[0].steps, Some(json!("[]")));
    }

    #[tokio::test]
    async fn collect_calls_send_query_id() {
        let server = MockServer::start().await;
        for route in [paths::ADD_COLLECT, paths::CANCEL_COLLECT] {
            Mock::given(method("POST"))
                .and(path(route))
                .and(body_json(json!({"queryId": "q-1"})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "code": 200, "message": "", "result": true
                })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let api = client(&server);
        let query_id = QueryId::new("q-1").unwrap();
        assert_eq!(api.add_collect(&query_id).await.unwrap().result, Some(true));
        assert_eq!(api.cancel_collect(&query_id).await.unwrap().result, Some(true));
    }

    #[tokio::test]
    async fn chat_crud_bodies() {
        let server = MockServer::start().await;
        let chat = json!({"chatId": "c-9", "title": "silver"});
        Mock::given(method("POST"))
            .and(path(paths::ADD_CHAT))
            .and(body_json(json!({"title": "silver"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200, "message": "", "result": chat
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(paths::UPDATE_CHAT))
            .and(body_json(json!({"chatId": "c-9", "title": "silver 2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200, "message": "", "result": {"chatId": "c-9", "title": "silver 2"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(paths::DELETE_CHAT))
            .and(body_json(json!({"chatId": "c-9"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200, "message": "", "result": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        let created = api.add_chat(Some("silver")).await.unwrap().result.unwrap();
        assert_eq!(created.chat_id.as_str(), "c-9");

        let renamed = api.update_chat(&created.chat_id, "silver 2").await.unwrap();
        assert_eq!(renamed.result.unwrap().title, "silver 2");

        let deleted = api.delete_chat(&created.chat_id).await.unwrap();
        assert_eq!(deleted.result, Some(true));
    }
}
