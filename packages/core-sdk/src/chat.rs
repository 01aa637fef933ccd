use std::time::Instant;

use crate::{
    db::{Storage, KEY_CHAT_SESSIONS, KEY_CURRENT_SESSION},
    error::{RelayError, Result},
    llm::{AbortHandle, RelaySession, StreamEvent, UpstreamClient, MISSING_KEY},
    models::{now_millis, ChatMessage, ChatSession, Role, WireMessage},
    settings::ConfigStore,
};

/** \brief 自动标题截取的字符数。 */
pub const TITLE_MAX_CHARS: usize = 20;
/** \brief 截断标题的省略标记。 */
pub const TITLE_ELLIPSIS: &str = "...";
/** \brief 上一轮仍在流式输出时的拒绝原因。 */
pub const BUSY: &str = "a reply is still streaming";
/** \brief 内容为空时的提示。 */
pub const EMPTY_CONTENT: &str = "message content must not be empty";

/**
 * \brief 一次已开始的对话轮次。
 * \details 通过 ID 定位目标会话与助手占位消息，每次更新都重新查找，
 *          流式期间切换会话不会写入新显示的会话。
 */
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub session_id: String,
    pub assistant_id: String,
    /** \brief 发往上游的历史（含本轮用户消息，不含空占位）。 */
    pub history: Vec<WireMessage>,
    started: Instant,
}

/**
 * \brief 由助手回复推导会话标题：前 20 个字符，截断时追加省略标记。
 */
pub fn derive_title(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        head
    }
}

/**
 * \brief 会话列表与发送状态。
 */
#[derive(Debug)]
pub struct ChatStore {
    storage: Storage,
    sessions: Vec<ChatSession>,
    current_session_id: String,
    is_sending: bool,
    is_streaming: bool,
    error: Option<String>,
    active_turn: Option<String>,
}

impl ChatStore {
    /**
     * \brief 加载会话；无会话时创建默认会话，当前 ID 无效时指向第一个会话。
     */
    pub fn load(storage: Storage) -> Self {
        let mut sessions: Vec<ChatSession> = storage.load_or(KEY_CHAT_SESSIONS, Vec::new());
        let mut current: String = storage.load_or(KEY_CURRENT_SESSION, String::new());

        if sessions.is_empty() {
            let session = ChatSession::new();
            current = session.id.clone();
            sessions.push(session);
            storage.save_best_effort(KEY_CHAT_SESSIONS, &sessions);
            storage.save_best_effort(KEY_CURRENT_SESSION, &current);
        } else if !sessions.iter().any(|s| s.id == current) {
            current = sessions[0].id.clone();
            storage.save_best_effort(KEY_CURRENT_SESSION, &current);
        }

        Self {
            storage,
            sessions,
            current_session_id: current,
            is_sending: false,
            is_streaming: false,
            error: None,
            active_turn: None,
        }
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn current_session_id(&self) -> &str {
        &self.current_session_id
    }

    pub fn current_session(&self) -> Option<&ChatSession> {
        self.session(&self.current_session_id)
    }

    pub fn session(&self, id: &str) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut ChatSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn is_sending(&self) -> bool {
        self.is_sending
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /** \brief 新建会话并设为当前会话。 */
    pub fn create_session(&mut self) -> String {
        let session = ChatSession::new();
        let id = session.id.clone();
        self.sessions.push(session);
        self.current_session_id = id.clone();
        self.persist_sessions();
        self.persist_current();
        id
    }

    pub fn switch_session(&mut self, id: &str) -> Result<()> {
        if self.session(id).is_none() {
            return Err(RelayError::validation(format!("unknown session: {id}")));
        }
        self.current_session_id = id.to_string();
        self.persist_current();
        Ok(())
    }

    /**
     * \brief 删除会话；删除当前会话时提升剩余列表中的第一个，列表为空则无当前会话。
     */
    pub fn delete_session(&mut self, id: &str) {
        self.sessions.retain(|s| s.id != id);
        if self.current_session_id == id {
            self.current_session_id = self
                .sessions
                .first()
                .map(|s| s.id.clone())
                .unwrap_or_default();
        }
        self.persist_sessions();
        self.persist_current();
    }

    pub fn update_session_title(&mut self, id: &str, title: &str) {
        if let Some(session) = self.session_mut(id) {
            session.title = title.to_string();
            session.updated_at = now_millis();
            self.persist_sessions();
        }
    }

    /**
     * \brief 开始一轮发送：校验后追加用户消息和空的助手占位。
     * \details 校验失败时记录用户可见错误并返回，不会发起网络请求。
     */
    pub fn begin_turn(&mut self, api_key: &str, content: &str) -> Result<PendingTurn> {
        if self.active_turn.is_some() {
            return Err(self.reject(RelayError::validation(BUSY)));
        }
        if api_key.trim().is_empty() {
            return Err(self.reject(RelayError::auth(MISSING_KEY)));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(self.reject(RelayError::validation(EMPTY_CONTENT)));
        }
        if self.current_session().is_none() {
            self.create_session();
        }

        let session_id = self.current_session_id.clone();
        let user = ChatMessage::new(Role::User, content);
        let assistant = ChatMessage::new(Role::Assistant, "");
        let assistant_id = assistant.id.clone();

        let history = {
            let Some(session) = self.session_mut(&session_id) else {
                return Err(RelayError::validation("no active session"));
            };
            session.messages.push(user);
            let history = session.messages.iter().map(ChatMessage::to_wire).collect();
            session.messages.push(assistant);
            session.updated_at = now_millis();
            history
        };

        self.error = None;
        self.is_sending = true;
        self.is_streaming = true;
        self.active_turn = Some(assistant_id.clone());
        self.persist_sessions();

        Ok(PendingTurn {
            session_id,
            assistant_id,
            history,
            started: Instant::now(),
        })
    }

    fn reject(&mut self, err: RelayError) -> RelayError {
        self.error = Some(err.to_string());
        err
    }

    fn is_active(&self, turn: &PendingTurn) -> bool {
        self.active_turn.as_deref() == Some(turn.assistant_id.as_str())
    }

    /**
     * \brief 追加一段增量到本轮的助手消息。
     */
    pub fn apply_delta(&mut self, turn: &PendingTurn, text: &str) {
        let Some(session) = self.session_mut(&turn.session_id) else {
            return;
        };
        match session.messages.last_mut() {
            Some(last) if last.id == turn.assistant_id => last.content.push_str(text),
            _ => return,
        }
        self.persist_sessions();
    }

    /**
     * \brief 本轮正常结束：记录耗时，首轮对话时推导标题，清除发送状态。
     */
    pub fn complete_turn(&mut self, turn: &PendingTurn) {
        if !self.is_active(turn) {
            return;
        }
        let elapsed = turn.started.elapsed().as_millis() as u64;
        let mut title = None;
        if let Some(session) = self.session_mut(&turn.session_id) {
            if let Some(msg) = session
                .messages
                .iter_mut()
                .find(|m| m.id == turn.assistant_id)
            {
                msg.response_time_ms = Some(elapsed);
            }
            session.updated_at = now_millis();
            if session.messages.len() == 2 && !session.messages[1].content.is_empty() {
                title = Some(derive_title(&session.messages[1].content));
            }
        }
        self.finish_turn();
        self.persist_sessions();
        if let Some(title) = title {
            self.update_session_title(&turn.session_id, &title);
        }
    }

    /**
     * \brief 本轮失败：记录错误，清除发送状态，移除空的助手占位。
     */
    pub fn fail_turn(&mut self, turn: &PendingTurn, message: &str) {
        if !self.is_active(turn) {
            return;
        }
        self.error = Some(message.to_string());
        if let Some(session) = self.session_mut(&turn.session_id) {
            session
                .messages
                .retain(|m| !(m.id == turn.assistant_id && m.content.is_empty()));
        }
        self.finish_turn();
        self.persist_sessions();
    }

    /** \brief 用户停止：立即清除发送状态。 */
    pub fn stop_streaming(&mut self) {
        self.finish_turn();
    }

    fn finish_turn(&mut self) {
        self.is_sending = false;
        self.is_streaming = false;
        self.active_turn = None;
    }

    fn persist_sessions(&self) {
        self.storage
            .save_best_effort(KEY_CHAT_SESSIONS, &self.sessions);
    }

    fn persist_current(&self) {
        self.storage
            .save_best_effort(KEY_CURRENT_SESSION, &self.current_session_id);
    }
}

/**
 * \brief 一轮对话的结局。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(RelayError),
    Cancelled,
}

/**
 * \brief 把中继会话事件写入会话状态的客户端。
 */
#[derive(Debug)]
pub struct ChatClient {
    pub chat: ChatStore,
    pub settings: ConfigStore,
    upstream: UpstreamClient,
    abort: Option<AbortHandle>,
}

impl ChatClient {
    pub fn new(storage: Storage, upstream: UpstreamClient) -> Self {
        Self {
            chat: ChatStore::load(storage.clone()),
            settings: ConfigStore::load(storage),
            upstream,
            abort: None,
        }
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    /**
     * \brief 开始一轮流式发送，返回轮次与中继会话。
     */
    pub fn start_turn(&mut self, content: &str) -> Result<(PendingTurn, RelaySession)> {
        let api_key = self.settings.api_key().to_string();
        let turn = self.chat.begin_turn(&api_key, content)?;
        match self
            .upstream
            .stream_chat(&api_key, &turn.history, self.settings.model_config())
        {
            Ok(session) => {
                self.abort = Some(session.abort_handle());
                Ok((turn, session))
            }
            Err(e) => {
                self.chat.fail_turn(&turn, &e.to_string());
                Err(e)
            }
        }
    }

    /**
     * \brief 消费中继事件直到结束或被取消。
     * \param on_delta 每段增量写入状态后回调，供界面实时输出
     */
    pub async fn drive_turn(
        &mut self,
        turn: PendingTurn,
        mut session: RelaySession,
        mut on_delta: impl FnMut(&str),
    ) -> TurnOutcome {
        let outcome = loop {
            match session.next_event().await {
                Some(StreamEvent::Delta(text)) => {
                    self.chat.apply_delta(&turn, &text);
                    on_delta(&text);
                }
                Some(StreamEvent::Done) => {
                    self.chat.complete_turn(&turn);
                    break TurnOutcome::Completed;
                }
                Some(StreamEvent::Error(e)) => {
                    self.chat.fail_turn(&turn, &e.to_string());
                    break TurnOutcome::Failed(e);
                }
                None => {
                    self.chat.stop_streaming();
                    break TurnOutcome::Cancelled;
                }
            }
        };
        self.abort = None;
        outcome
    }

    /**
     * \brief 发送一条消息并等待本轮结束。
     */
    pub async fn send_message(
        &mut self,
        content: &str,
        on_delta: impl FnMut(&str),
    ) -> Result<TurnOutcome> {
        let (turn, session) = self.start_turn(content)?;
        Ok(self.drive_turn(turn, session, on_delta).await)
    }

    /**
     * \brief 停止操作的入口：本轮进行中时返回可跨任务克隆的取消句柄。
     * \details 句柄取消后 `drive_turn` 立即结束并清除发送状态，已收到的内容保留在占位消息中，
     *          之后到达的事件全部丢弃。
     */
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.abort.clone()
    }
}
