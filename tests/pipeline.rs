mod common;

use common::{build_assistant, create_test_database, customer_count, test_config, ScriptedModel};
use rusqlite::Connection;
use sql_assistant::reply::ReplyKind;
use sql_assistant::session::{Role, SessionStore, SqliteSessionStore};
use sql_assistant::{Assistant, AssistantError, ExecutionFailure, REFUSAL_MESSAGE};
use std::error::Error;
use std::sync::Arc;

const GERMANY_SQL: &str = "SELECT id, name, country FROM customers WHERE country = 'Germany' ORDER BY id";

#[tokio::test]
async fn germany_question_runs_gated_query_and_reports() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(
        ScriptedModel::new()
            .reply("sql", "Looking up German customers", GERMANY_SQL)
            .completion("Two customers are based in Germany: Anna and Clara.")
            .reply("done", "Anna and Clara are your customers from Germany.", ""),
    );
    let (assistant, store) = build_assistant(&test_config(&db), model.clone());

    let outcome = assistant
        .chat(None, "show me all customers from Germany")
        .await?;

    assert_eq!(outcome.kind, ReplyKind::Done);
    assert_eq!(outcome.turns_executed, 2);
    assert_eq!(outcome.final_message, "Anna and Clara are your customers from Germany.");
    assert_eq!(outcome.last_query, GERMANY_SQL);
    assert_eq!(outcome.sql_history.len(), 1);
    assert_eq!(outcome.sql_history[0].report, "Two customers are based in Germany: Anna and Clara.");

    // Same rows as running the statement directly
    let conn = Connection::open(&db)?;
    let mut stmt = conn.prepare(GERMANY_SQL)?;
    let direct: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    let returned: Vec<String> = outcome
        .last_results
        .iter()
        .map(|row| row["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(returned, direct);
    assert!(outcome.last_results.iter().all(|row| row["country"] == "Germany"));

    // Second model call saw the first step's rows
    let seen = model.seen();
    let last_prompt = seen.last().unwrap();
    assert!(last_prompt.iter().any(|m| m.role == "system" && m.content.contains("query_results")));

    let history = store.history(&outcome.session_id)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].sql(), Some(GERMANY_SQL));
    assert!(history[2].sql().is_none());
    Ok(())
}

#[tokio::test]
async fn single_pass_returns_the_report() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let mut config = test_config(&db);
    config.pipeline.max_iterations = 1;
    let model = Arc::new(
        ScriptedModel::new()
            .reply("sql", "", "SELECT COUNT(*) AS n FROM stores")
            .completion("There are two stores."),
    );
    let (assistant, _store) = build_assistant(&config, model.clone());

    let outcome = assistant.chat(None, "how many stores?").await?;
    assert_eq!(outcome.kind, ReplyKind::Sql);
    assert_eq!(outcome.turns_executed, 1);
    assert_eq!(outcome.final_message, "There are two stores.");
    assert_eq!(outcome.last_results[0]["n"], 2);
    assert_eq!(model.remaining(), 0);
    Ok(())
}

#[tokio::test]
async fn unsafe_query_is_refused_and_database_is_unchanged() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(ScriptedModel::new().reply("sql", "Cleaning up", "DELETE FROM customers"));
    let (assistant, store) = build_assistant(&test_config(&db), model);

    let outcome = assistant.chat(Some("s1".to_string()), "remove every customer").await?;

    assert_eq!(outcome.kind, ReplyKind::Chat);
    assert_eq!(outcome.final_message, REFUSAL_MESSAGE);
    assert!(outcome.last_query.is_empty());
    assert!(outcome.sql_history.is_empty());
    assert_eq!(customer_count(&db), 4);

    let history = store.history("s1")?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|turn| turn.sql().is_none()));
    Ok(())
}

#[tokio::test]
async fn provider_outage_surfaces_as_upstream_error() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(ScriptedModel::new().failing_call("503 Service Unavailable"));
    let (assistant, _store) = build_assistant(&test_config(&db), model);

    let err = assistant.chat(None, "hello").await.unwrap_err();
    assert!(err.is_upstream());
    assert!(!err.public_message().contains("503"));

    let err = assistant.generate_sql("customers from Germany").await.unwrap_err();
    assert!(err.is_upstream());
    Ok(())
}

#[tokio::test]
async fn ambiguous_reply_is_rejected() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(ScriptedModel::new().reply("chat", "Here you go", "SELECT * FROM customers"));
    let (assistant, _store) = build_assistant(&test_config(&db), model);

    let err = assistant.chat(None, "customers?").await.unwrap_err();
    assert!(matches!(err, AssistantError::MalformedReply(_)));
    Ok(())
}

#[tokio::test]
async fn execution_errors_are_categorized() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let mut config = test_config(&db);
    config.pipeline.max_iterations = 1;
    let model = Arc::new(ScriptedModel::new().reply("sql", "", "SELECT * FROM orders"));
    let (assistant, store) = build_assistant(&config, model);

    let outcome = assistant.chat(Some("s".to_string()), "list orders").await?;
    assert_eq!(outcome.kind, ReplyKind::Chat);
    assert_eq!(outcome.final_message, ExecutionFailure::MissingTable.public_message());
    assert!(!outcome.final_message.contains("orders"));
    assert!(outcome.sql_history.is_empty());

    let history = store.history("s")?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, outcome.final_message);
    assert!(history[1].sql().is_none());
    Ok(())
}

#[tokio::test]
async fn failed_step_is_handed_back_and_earlier_steps_are_kept() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(
        ScriptedModel::new()
            .reply("sql", "", "SELECT COUNT(*) AS n FROM customers")
            .completion("There are four customers.")
            .reply("sql", "", "SELECT total FROM orders")
            .reply("done", "There are four customers; no order data is available.", ""),
    );
    let (assistant, store) = build_assistant(&test_config(&db), model.clone());

    let outcome = assistant.chat(Some("s".to_string()), "customers and their orders?").await?;
    assert_eq!(outcome.kind, ReplyKind::Done);
    assert_eq!(outcome.turns_executed, 3);
    assert_eq!(outcome.final_message, "There are four customers; no order data is available.");
    assert_eq!(outcome.sql_history.len(), 1);
    assert_eq!(outcome.sql_history[0].report, "There are four customers.");
    assert_eq!(outcome.last_query, "SELECT COUNT(*) AS n FROM customers");

    let seen = model.seen();
    let last_prompt = seen.last().unwrap();
    let note = last_prompt.last().unwrap();
    assert_eq!(note.role, "system");
    assert!(note.content.contains("MissingTable"));
    assert!(!note.content.contains("no such table"));

    let history = store.history("s")?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].sql(), Some("SELECT COUNT(*) AS n FROM customers"));
    assert_eq!(history[2].content, outcome.final_message);
    Ok(())
}

#[tokio::test]
async fn step_limit_after_a_failed_query_explains_the_failure() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let mut config = test_config(&db);
    config.pipeline.max_iterations = 2;
    let model = Arc::new(
        ScriptedModel::new()
            .reply("sql", "", "SELECT COUNT(*) AS n FROM customers")
            .completion("There are four customers.")
            .reply("sql", "", "SELECT total FROM orders"),
    );
    let (assistant, store) = build_assistant(&config, model.clone());

    let outcome = assistant.chat(Some("s".to_string()), "customers and their orders?").await?;
    assert_eq!(outcome.kind, ReplyKind::Chat);
    assert_eq!(outcome.final_message, ExecutionFailure::MissingTable.public_message());
    assert_eq!(outcome.sql_history.len(), 1);
    assert_eq!(outcome.last_results[0]["n"], 4);
    assert_eq!(model.remaining(), 0);

    let history = store.history("s")?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].content, outcome.final_message);
    Ok(())
}

#[tokio::test]
async fn failed_model_call_leaves_no_dangling_user_turn() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(
        ScriptedModel::new()
            .failing_call("503 Service Unavailable")
            .reply("chat", "Hello again.", ""),
    );
    let (assistant, store) = build_assistant(&test_config(&db), model.clone());

    assert!(assistant.chat(Some("s".to_string()), "hello").await.is_err());
    assert!(store.history("s")?.is_empty());

    assistant.chat(Some("s".to_string()), "hello").await?;
    let roles: Vec<Role> = store.history("s")?.iter().map(|turn| turn.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);

    let retry_prompt = &model.seen()[1];
    assert_eq!(retry_prompt.len(), 2);
    Ok(())
}

#[tokio::test]
async fn sqlite_backed_sessions_are_read_through_the_assistant() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let config = test_config(&db);
    let store = Arc::new(SqliteSessionStore::open(dir.path().join("chat.db"), config.sessions.max_turns)?);
    let model = Arc::new(ScriptedModel::new().reply("chat", "Hi! I'm Bo.", ""));
    let assistant = Assistant::new(&config, model, store);

    let outcome = assistant.chat(None, "hello").await?;
    let history = assistant.history(&outcome.session_id).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Hi! I'm Bo.");

    let sessions = assistant.sessions().await?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].first_message.as_deref(), Some("hello"));
    assert_eq!(assistant.sweep().await?, 0);
    Ok(())
}

#[tokio::test]
async fn follow_up_messages_see_earlier_turns() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(
        ScriptedModel::new()
            .reply("chat", "Hi! I'm Bo.", "")
            .reply("chat", "You said hello.", ""),
    );
    let (assistant, _store) = build_assistant(&test_config(&db), model.clone());

    let first = assistant.chat(None, "hello").await?;
    assert!(!first.session_id.is_empty());
    assert_eq!(first.kind, ReplyKind::Chat);

    let second = assistant
        .chat(Some(first.session_id.clone()), "what did I say?")
        .await?;
    assert_eq!(second.session_id, first.session_id);

    let prompt = &model.seen()[1];
    let contents: Vec<&str> = prompt.iter().skip(1).map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "Hi! I'm Bo.", "what did I say?"]);
    assert!(prompt[0].content.contains("customers:"));

    let history = assistant.history(&first.session_id).await?;
    assert_eq!(history.len(), 4);
    assert_eq!(assistant.sessions().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn one_shot_generation_goes_through_the_gate() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let model = Arc::new(
        ScriptedModel::new()
            .completion("```sql\nSELECT name FROM customers WHERE country = 'Germany';\n```")
            .completion("DROP TABLE customers")
            .completion("SELECT name FROM customers WHERE country = 'Spain'")
            .completion("Dmitri is the only customer from Spain."),
    );
    let (assistant, _store) = build_assistant(&test_config(&db), model);

    let sql = assistant.generate_sql("customers from Germany").await?;
    assert_eq!(sql.as_str(), "SELECT name FROM customers WHERE country = 'Germany'");

    let err = assistant.generate_sql("drop customers").await.unwrap_err();
    assert!(matches!(err, AssistantError::UnsafeQuery(_)));
    assert_eq!(customer_count(&db), 4);

    let report = assistant.report("customers from Spain").await?;
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.columns, vec!["name"]);
    assert_eq!(report.report, "Dmitri is the only customer from Spain.");
    Ok(())
}

#[tokio::test]
async fn execute_sql_rejects_writes() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let (assistant, _store) = build_assistant(&test_config(&db), Arc::new(ScriptedModel::new()));

    let rows = assistant.execute_sql("SELECT * FROM stores").await?;
    assert_eq!(rows.rows.len(), 2);

    for sql in [
        "UPDATE customers SET country = 'X'",
        "SELECT 1; DELETE FROM customers",
        "select * from customers where name = 'drop'",
    ] {
        let err = assistant.execute_sql(sql).await.unwrap_err();
        assert!(matches!(err, AssistantError::UnsafeQuery(_)), "{}", sql);
    }
    assert_eq!(customer_count(&db), 4);
    Ok(())
}

#[tokio::test]
async fn empty_message_is_an_invalid_request() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let db = create_test_database(dir.path())?;
    let (assistant, store) = build_assistant(&test_config(&db), Arc::new(ScriptedModel::new()));

    let err = assistant.chat(Some("s".to_string()), "   ").await.unwrap_err();
    assert!(matches!(err, AssistantError::InvalidRequest(_)));
    assert!(store.sessions()?.is_empty());
    Ok(())
}
