//! Query generation: seed documents in, search queries out.
//!
//! Each input is a batch of documents. The batch is joined into one context
//! block, sent to the language model with a fixed instruction, and the
//! response is parsed line-by-line for the `Query:` marker. A model or parse
//! failure costs that batch its queries and nothing else.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use flywheel_scheduler::{SlotId, Stage, StageFanout};
use flywheel_shared::{Result, Task, TaskLog};

use crate::llm::{strip_preamble, ChatMessage, LanguageModel, QUERY_MARKER, QUERY_PREAMBLE};

const SYSTEM_INSTRUCTIONS: &str = "\
You are a research assistant generating web search queries from reference \
documents. Read the provided passages, then produce question-answer pairs \
that probe the topics the passages cover, including adjacent topics a \
curious reader would explore next. For each pair, also produce one concise \
web search query that would surface pages answering the question. Begin \
your response with the line \"Here are the 25 question-answer pairs:\" and \
tag every search query on its own line starting with \"Query:\".";

/// Generates search queries from batches of seed documents.
pub struct QueryGenStage {
    llm: Arc<dyn LanguageModel>,
    fanout: StageFanout,
    queries_per_batch: usize,
    task_log: Option<TaskLog>,
}

impl QueryGenStage {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        fanout: StageFanout,
        queries_per_batch: usize,
        task_log: Option<TaskLog>,
    ) -> Self {
        Self {
            llm,
            fanout,
            queries_per_batch,
            task_log,
        }
    }

    fn prompt(&self, context: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(SYSTEM_INSTRUCTIONS),
            ChatMessage::user(format!(
                "Generate {} question-answer pairs with search queries from \
                 the following passages:\n\n{context}",
                self.queries_per_batch
            )),
        ]
    }
}

impl Stage for QueryGenStage {
    type Input = Vec<String>;
    type Output = Task<String, String>;

    fn fanout(&self) -> StageFanout {
        self.fanout
    }

    #[instrument(skip_all, fields(slot = slot, docs = task.len()))]
    async fn process(&self, slot: SlotId, task: Self::Input) -> Result<Vec<Self::Output>> {
        let context = task.join("\n\n");

        let response = match self.llm.respond(&self.prompt(&context)).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%slot, %error, "query generation failed, dropping batch");
                return Ok(Vec::new());
            }
        };

        let body = strip_preamble(&response, QUERY_PREAMBLE);
        let queries = crate::llm::extract_marked_lines(body, QUERY_MARKER);
        if queries.is_empty() {
            warn!(%slot, "model response held no tagged queries, dropping batch");
            return Ok(Vec::new());
        }

        if let Some(log) = &self.task_log {
            if let Err(error) = log
                .append(&serde_json::json!({
                    "docs": task.len(),
                    "queries": queries,
                }))
                .await
            {
                warn!(%error, "query log append failed");
            }
        }

        info!(%slot, queries = queries.len(), "queries generated");
        Ok(queries
            .into_iter()
            .map(|query| Task::new(context.clone(), query))
            .collect())
    }
}
