use crate::llm::models::GenerationRequest;
use minijinja::{Environment, context};
use tracing::debug;

/// Answer the model gives when no read query can answer the question.
pub const NO_QUERY_SENTINEL: &str = "NO_QUERY";

const PROMPT_TEMPLATE_NAME: &str = "sql_prompt.txt";

const PROMPT_TEMPLATE: &str = r#"### Instructions:
Your task is to convert a question into a single read-only SQL query for DuckDB, given a database schema.
Adhere to these rules:
- **Use the exact spelling of table and column names as provided in the schema**
- **Only use the tables listed in the schema**
- **Deliberately go through the question and database schema word by word** to appropriately answer the question
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT op.prod_name, ots.status FROM order_product op JOIN order_tracking_status ots ON op.order_id = ots.order_id`.
- Write exactly one SELECT statement. Never insert, update, delete or change anything.
- When creating a ratio, always cast the numerator as float
- If no read-only query over these tables answers the question, reply with exactly {{ sentinel }} and nothing else

### Schema:
{{ schema }}
{% if examples %}
### Examples:
{% for example in examples %}
Question: {{ example.question }}
```sql
{{ example.sql }}
```
{% endfor %}{% endif %}{% if turns %}
### Conversation so far:
{% for turn in turns %}{{ turn.role }}: {{ turn.text }}
{% endfor %}{% endif %}{% if feedback %}
### Correction:
Your previous answer was rejected ({{ feedback.code }}). {{ feedback.hint }}
{% endif %}
### Input:
Generate a SQL query that answers the question `{{ question }}`.

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{{ question }}`:
"#;

pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(PROMPT_TEMPLATE_NAME, PROMPT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render(&self, request: &GenerationRequest) -> Result<String, minijinja::Error> {
        let snapshot = &request.snapshot;
        let feedback = request.feedback.map(|code| {
            context! {
                code => code.as_str(),
                hint => code.correction_hint(),
            }
        });

        let prompt = self.env.get_template(PROMPT_TEMPLATE_NAME)?.render(context! {
            sentinel => NO_QUERY_SENTINEL,
            schema => snapshot.descriptor.to_ddl(),
            examples => &snapshot.examples,
            turns => request.context.turns(),
            feedback => feedback,
            question => &request.question,
        })?;

        debug!("Prepared LLM prompt: {}", prompt);
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema_manager::SchemaSnapshot;
    use crate::llm::models::{ConversationContext, FewShotExample, Role};
    use crate::schema::tests::storefront;
    use crate::validate::ReasonCode;
    use std::sync::Arc;

    fn request(context: ConversationContext) -> GenerationRequest {
        let snapshot = SchemaSnapshot::new(
            storefront(),
            vec![FewShotExample {
                question: "How many orders were cancelled?".to_string(),
                sql: "SELECT COUNT(*) AS cancelled_orders FROM order_product WHERE status = 'Cancelled'"
                    .to_string(),
            }],
        );
        GenerationRequest::new("Show all fertilizer products", context, Arc::new(snapshot))
    }

    #[test]
    fn embeds_schema_examples_and_question() {
        let builder = PromptBuilder::new().expect("template");
        let prompt = builder.render(&request(ConversationContext::new())).expect("prompt");

        assert!(prompt.contains("CREATE TABLE order_product"));
        assert!(prompt.contains("How many orders were cancelled?"));
        assert!(prompt.contains("status = 'Cancelled'"));
        assert!(prompt.contains("`Show all fertilizer products`"));
        assert!(prompt.contains(NO_QUERY_SENTINEL));
        assert!(!prompt.contains("### Conversation so far"));
        assert!(!prompt.contains("### Correction"));
    }

    #[test]
    fn renders_conversation_and_feedback() {
        let context = ConversationContext::new()
            .with_turn(Role::User, "What did I order last week?")
            .with_turn(Role::Assistant, "Two bags of urea.");
        let request = request(context).with_feedback(ReasonCode::UnknownTableOrColumn);

        let prompt = PromptBuilder::new()
            .expect("template")
            .render(&request)
            .expect("prompt");

        assert!(prompt.contains("user: What did I order last week?"));
        assert!(prompt.contains("assistant: Two bags of urea."));
        assert!(prompt.contains("UNKNOWN_TABLE_OR_COLUMN"));
        assert!(prompt.contains(ReasonCode::UnknownTableOrColumn.correction_hint()));
    }
}
