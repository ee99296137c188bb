//! System instruction sent ahead of every question

use std::fmt;

/// Dialect guidance for the model.
///
/// PostgreSQL gets concrete catalog examples and a warning against MySQL
/// habits; other dialects get the short form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemPrompt {
    /// SQL dialect name, e.g. `PostgreSQL`
    pub dialect: String,

    /// Name of the tool parameter that carries the SQL text
    pub sql_param: String,
}

impl Default for SystemPrompt {
    fn default() -> Self {
        Self::new("PostgreSQL")
    }
}

impl SystemPrompt {
    pub fn new(dialect: impl Into<String>) -> Self {
        Self {
            dialect: dialect.into(),
            sql_param: "sql".into(),
        }
    }

    pub fn with_sql_param(mut self, param: impl Into<String>) -> Self {
        self.sql_param = param.into();
        self
    }

    fn is_postgres(&self) -> bool {
        matches!(self.dialect.to_ascii_lowercase().as_str(), "postgresql" | "postgres")
    }

    /// Full instruction text
    pub fn render(&self) -> String {
        let mut prompt = format!(
            "You are a helpful assistant that can explore {} databases using SQL queries.\n\n",
            self.dialect
        );

        if self.is_postgres() {
            prompt.push_str(POSTGRES_GUIDANCE);
        } else {
            prompt.push_str(&format!("IMPORTANT: Use {} syntax.\n\n", self.dialect));
        }

        prompt.push_str(&format!(
            "When using the query tool, always provide the full SQL query in the '{}' parameter.",
            self.sql_param
        ));
        prompt
    }
}

impl fmt::Display for SystemPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

const POSTGRES_GUIDANCE: &str = "IMPORTANT: Use PostgreSQL syntax, NOT MySQL syntax. For example:
- To list all tables: SELECT table_name FROM information_schema.tables WHERE table_schema = 'public';
- To describe a table: SELECT column_name, data_type FROM information_schema.columns WHERE table_name = 'table_name';
- To show database size: SELECT pg_size_pretty(pg_database_size(current_database()));

Avoid using MySQL commands like SHOW TABLES, DESCRIBE table_name, etc. as they won't work in PostgreSQL.

";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_prompt_carries_catalog_examples() {
        let prompt = SystemPrompt::default().render();
        assert!(prompt.starts_with("You are a helpful assistant that can explore PostgreSQL databases"));
        assert!(prompt.contains("information_schema.tables WHERE table_schema = 'public'"));
        assert!(prompt.contains("pg_size_pretty(pg_database_size(current_database()))"));
        assert!(prompt.contains("SHOW TABLES"));
        assert!(prompt.ends_with("in the 'sql' parameter."));
    }

    #[test]
    fn other_dialects_get_short_form() {
        let prompt = SystemPrompt::new("SQLite").with_sql_param("statement").render();
        assert!(prompt.contains("explore SQLite databases"));
        assert!(!prompt.contains("information_schema"));
        assert!(prompt.contains("'statement' parameter"));
    }
}
