//! Runs one agent invocation end to end: lookup, execution row, LLM call,
//! cost recording, terminal status.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cost::estimate_call;
use crate::error::{ServiceError, ServiceResult};
use crate::ledger::CostLedger;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::store::{Agent, Database, Execution, ExecutionOutcome, NewCostEntry};

/// Cost type recorded for every successful model call.
pub const LLM_CALL_COST_TYPE: &str = "llm_call";

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub agent_id: i64,
    pub user_id: i64,
    pub input: String,
    /// Extra JSON handed to the model as a system message.
    pub context: Option<Value>,
}

/// Messages sent to the model for one invocation.
///
/// The system prompt (with the personality appended) comes first, then the
/// context as pretty-printed JSON, then the user input.
pub fn build_messages(agent: &Agent, input: &str, context: Option<&Value>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(3);

    if let Some(prompt) = agent.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        let mut system = prompt.to_string();
        if let Some(personality) = agent.personality.as_deref().filter(|p| !p.is_empty()) {
            system.push_str("\n\nPersonality: ");
            system.push_str(personality);
        }
        messages.push(ChatMessage::system(system));
    }

    if let Some(context) = context.filter(|c| !is_empty_context(c)) {
        let pretty = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        messages.push(ChatMessage::system(format!("Context: {}", pretty)));
    }

    messages.push(ChatMessage::user(input));
    messages
}

fn is_empty_context(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn chat_options(agent: &Agent) -> ChatOptions {
    ChatOptions {
        temperature: Some(agent.temperature),
        max_tokens: Some(agent.max_tokens),
        top_p: Some(agent.top_p),
        frequency_penalty: Some(agent.frequency_penalty),
        presence_penalty: Some(agent.presence_penalty),
    }
}

#[derive(Clone)]
pub struct AgentExecutor {
    db: Database,
    llm: Arc<dyn LlmClient>,
    ledger: CostLedger,
}

impl AgentExecutor {
    pub fn new(db: Database, llm: Arc<dyn LlmClient>, ledger: CostLedger) -> Self {
        Self { db, llm, ledger }
    }

    /// Execute an agent against `request.input`.
    ///
    /// Unknown or inactive agents fail before any execution row is written.
    /// A failed model call is not an error here: the returned execution is
    /// `failed` with the message recorded, and no cost is charged.
    pub async fn execute(&self, request: ExecuteRequest) -> ServiceResult<Execution> {
        let agent = self
            .db
            .get_agent(request.agent_id)
            .await?
            .ok_or(ServiceError::AgentNotFound(request.agent_id))?;
        if !agent.is_active {
            return Err(ServiceError::AgentInactive(agent.name));
        }

        let execution = self
            .db
            .insert_running_execution(agent.id, request.user_id, &request.input)
            .await?;
        info!(
            "Executing agent {} ({}) as execution {}",
            agent.name, agent.id, execution.id
        );

        let messages = build_messages(&agent, &request.input, request.context.as_ref());
        let started = Instant::now();
        let reply = self
            .llm
            .chat_completion(&agent.model_name, &messages, &chat_options(&agent))
            .await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let response = match reply {
            Ok(response) => response,
            Err(e) => {
                warn!("LLM call failed for agent {}: {}", agent.name, e);
                return Ok(self
                    .db
                    .finish_execution(
                        execution.id,
                        ExecutionOutcome::Failed {
                            error: e.to_string(),
                            execution_time_ms,
                        },
                    )
                    .await?);
            }
        };

        let estimate = estimate_call(&agent.model_name, &request.input, &response.content);
        debug!(
            "Execution {} used ~{} tokens costing {}",
            execution.id, estimate.tokens, estimate.cost
        );

        let entry = NewCostEntry::new(request.user_id, LLM_CALL_COST_TYPE, estimate.cost)
            .agent(agent.id)
            .execution(execution.id)
            .tokens(estimate.words_in, estimate.words_out)
            .description(format!("LLM call for agent {}", agent.name));
        if let Err(e) = self.ledger.record(entry).await {
            error!(
                "Failed to record cost for execution {}: {}",
                execution.id, e
            );
            self.db
                .finish_execution(
                    execution.id,
                    ExecutionOutcome::Failed {
                        error: format!("Failed to record cost: {}", e),
                        execution_time_ms,
                    },
                )
                .await?;
            return Err(e);
        }

        Ok(self
            .db
            .finish_execution(
                execution.id,
                ExecutionOutcome::Completed {
                    output: response.content,
                    execution_time_ms,
                    tokens_used: estimate.tokens,
                    cost: estimate.cost,
                },
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, Role};
    use crate::store::test_support::seed_user;
    use crate::store::{AgentUpdate, CostFilter, ExecutionFilter, ExecutionStatus, NewAgent};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies and remembers what it was sent.
    #[derive(Default)]
    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        seen: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    }

    impl ScriptedLlm {
        fn replying(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            model: &str,
            messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::network_error("script exhausted".into())));
            reply.map(|content| ChatResponse {
                content,
                usage: None,
                model: Some(model.to_string()),
            })
        }
    }

    struct Fixture {
        db: Database,
        ledger: CostLedger,
        user: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let user = seed_user(&db, "runner", crate::store::Role::User).await;
        Fixture {
            ledger: CostLedger::new(db.clone()),
            db,
            user,
        }
    }

    fn executor(f: &Fixture, llm: Arc<ScriptedLlm>) -> AgentExecutor {
        AgentExecutor::new(f.db.clone(), llm, f.ledger.clone())
    }

    async fn cost_count(f: &Fixture) -> usize {
        f.ledger
            .entries(f.user, CostFilter::default(), 0, 100)
            .await
            .unwrap()
            .len()
    }

    fn request(agent_id: i64, user_id: i64, input: &str) -> ExecuteRequest {
        ExecuteRequest {
            agent_id,
            user_id,
            input: input.to_string(),
            context: None,
        }
    }

    #[test]
    fn messages_include_personality_and_context() {
        let mut agent = sample_agent();
        agent.system_prompt = Some("You help.".into());
        agent.personality = Some("Cheerful".into());
        let context = json!({"city": "Oslo"});

        let messages = build_messages(&agent, "weather?", Some(&context));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "You help.\n\nPersonality: Cheerful");
        assert!(messages[1].content.starts_with("Context: {\n"));
        assert!(messages[1].content.contains("\"city\": \"Oslo\""));
        assert_eq!(messages[2], ChatMessage::user("weather?"));
    }

    #[test]
    fn messages_skip_missing_prompt_and_empty_context() {
        let mut agent = sample_agent();
        agent.personality = Some("ignored without a system prompt".into());
        let messages = build_messages(&agent, "hi", Some(&json!({})));
        assert_eq!(messages, vec![ChatMessage::user("hi")]);
    }

    fn sample_agent() -> Agent {
        Agent {
            id: 1,
            name: "a".into(),
            description: None,
            system_prompt: None,
            personality: None,
            model_name: "gpt-4".into(),
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            rate_limit_per_minute: 10,
            is_active: true,
            owner_id: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected_without_side_effects() {
        let f = fixture().await;
        let llm = ScriptedLlm::replying(vec![]);
        let err = executor(&f, llm.clone())
            .execute(request(42, f.user, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AgentNotFound(42)));
        assert_eq!(err.to_string(), "Agent with id 42 not found");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn inactive_agent_creates_no_execution() {
        let f = fixture().await;
        let agent = f
            .db
            .create_agent(f.user, NewAgent::named("sleepy"))
            .await
            .unwrap();
        f.db
            .update_agent(
                agent.id,
                AgentUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
                |_| Ok(()),
            )
            .await
            .unwrap();

        let llm = ScriptedLlm::replying(vec![]);
        let err = executor(&f, llm.clone())
            .execute(request(agent.id, f.user, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AgentInactive(ref name) if name == "sleepy"));
        assert_eq!(llm.calls(), 0);
        let listed = f
            .db
            .list_executions(
                f.user,
                ExecutionFilter {
                    limit: 50,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn successful_call_completes_and_records_cost() {
        let f = fixture().await;
        let mut new = NewAgent::named("helper");
        new.model_name = "gpt-4".into();
        new.system_prompt = Some("Be brief.".into());
        let agent = f.db.create_agent(f.user, new).await.unwrap();

        let llm = ScriptedLlm::replying(vec![Ok("general kenobi you are bold".into())]);
        let execution = executor(&f, llm.clone())
            .execute(request(agent.id, f.user, "hello there"))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output_data.as_deref(), Some("general kenobi you are bold"));
        assert_eq!(execution.tokens_used, 9);
        assert_eq!(execution.cost, dec!(0.00027));
        assert!(execution.completed_at.is_some());
        assert!(execution.execution_time_ms.is_some());

        let entries = f
            .ledger
            .entries(f.user, CostFilter::default(), 0, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.cost_type, LLM_CALL_COST_TYPE);
        assert_eq!(entry.amount, execution.cost);
        assert_eq!(entry.execution_id, Some(execution.id));
        assert_eq!(entry.agent_id, Some(agent.id));
        assert_eq!(entry.tokens_input, 2);
        assert_eq!(entry.tokens_output, 5);
        assert_eq!(entry.description.as_deref(), Some("LLM call for agent helper"));

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].0, "gpt-4");
        assert_eq!(seen[0].1[0], ChatMessage::system("Be brief."));
    }

    #[tokio::test]
    async fn failed_call_marks_execution_failed_without_cost() {
        let f = fixture().await;
        let agent = f
            .db
            .create_agent(f.user, NewAgent::named("flaky"))
            .await
            .unwrap();

        let llm = ScriptedLlm::replying(vec![Err(LlmError::server_error(
            503,
            "overloaded".into(),
        ))]);
        let execution = executor(&f, llm)
            .execute(request(agent.id, f.user, "hello"))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error_message.as_deref().unwrap().contains("overloaded"));
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.cost, Decimal::ZERO);
        assert_eq!(cost_count(&f).await, 0);
    }
}
