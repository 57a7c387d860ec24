//! Owner-scoped listing and search over stored messages.
//!
//! Tombstoned messages never appear here. Pagination is 1-indexed; a page
//! past the end is empty but still reports the correct total.

use crate::config::ListingSettings;
use crate::email::database::{row_to_attachment, DatabaseResult, EmailDatabase, MESSAGE_COLUMNS};
use crate::email::message::{Folder, Page, SortDirection, SortField, StoredAttachment, StoredMessage};
use sqlx::{QueryBuilder, Sqlite};

/// Filters and ordering for a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// `None` lists every folder
    pub folder: Option<Folder>,
    /// Restrict to one of the owner's aliases
    pub alias_id: Option<i64>,
    pub page: u32,
    /// `None` uses the configured default
    pub page_size: Option<u32>,
    pub sort: SortField,
    pub direction: SortDirection,
}

impl ListQuery {
    pub fn folder(folder: Folder) -> Self {
        Self {
            folder: Some(folder),
            page: 1,
            ..Self::default()
        }
    }

    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = Some(page_size);
        self
    }
}

/// Query engine for list, search and owner-scoped reads
#[derive(Debug, Clone)]
pub struct MessageQueryEngine {
    db: EmailDatabase,
    limits: ListingSettings,
}

impl MessageQueryEngine {
    pub fn new(db: EmailDatabase, limits: ListingSettings) -> Self {
        Self { db, limits }
    }

    /// Page of the owner's messages, newest first unless asked otherwise
    pub async fn list(&self, owner: i64, query: &ListQuery) -> DatabaseResult<Page<StoredMessage>> {
        let (page, page_size, offset) = self.paging(query.page, query.page_size);

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM messages m JOIN aliases a ON a.id = m.alias_id",
        );
        push_list_filters(&mut count, owner, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.db.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM messages m JOIN aliases a ON a.id = m.alias_id",
            MESSAGE_COLUMNS
        ));
        push_list_filters(&mut select, owner, query);
        let direction = query.direction.keyword();
        select.push(format!(
            " ORDER BY {} {}, m.id {} LIMIT ",
            query.sort.column(),
            direction,
            direction
        ));
        select.push_bind(page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.db.pool).await?;
        let items = self.db.hydrate(rows).await?;

        Ok(Page::new(items, total as u64, page, page_size))
    }

    /// Full-text search over subject and body, plus substring match on the
    /// sender and on every recipient address. Text matches rank first by
    /// relevance; everything else follows newest first.
    pub async fn search(
        &self,
        owner: i64,
        text: &str,
        page: u32,
        page_size: Option<u32>,
    ) -> DatabaseResult<Page<StoredMessage>> {
        let (page, page_size, offset) = self.paging(page, page_size);
        let text = text.trim();
        if text.is_empty() {
            return Ok(Page::new(Vec::new(), 0, page, page_size));
        }

        let fts_query = fts_match_expression(text);
        let pattern = format!("%{}%", escape_like(text));

        let mut count = QueryBuilder::<Sqlite>::new("");
        push_search_base(&mut count, "COUNT(*)", fts_query.as_deref(), owner, &pattern);
        let total: i64 = count.build_query_scalar().fetch_one(&self.db.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new("");
        push_search_base(&mut select, MESSAGE_COLUMNS, fts_query.as_deref(), owner, &pattern);
        select.push(" ORDER BY (fts.id IS NULL), fts.score, m.created_at DESC, m.id DESC LIMIT ");
        select.push_bind(page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.db.pool).await?;
        let items = self.db.hydrate(rows).await?;

        Ok(Page::new(items, total as u64, page, page_size))
    }

    /// One visible message of the owner, with no side effects
    pub async fn get_message(&self, owner: i64, message: i64) -> DatabaseResult<Option<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages m JOIN aliases a ON a.id = m.alias_id \
             WHERE m.id = ?1 AND a.user_id = ?2 AND m.is_deleted = FALSE",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(message)
            .bind(owner)
            .fetch_optional(&self.db.pool)
            .await?;

        match row {
            Some(row) => Ok(self.db.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Attachment metadata, if it belongs to a visible message of the owner
    pub async fn attachment(&self, owner: i64, attachment: i64) -> DatabaseResult<Option<StoredAttachment>> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.message_id, t.filename, t.content_type, t.size, t.blob_name, t.created_at
            FROM attachments t
            JOIN messages m ON m.id = t.message_id
            JOIN aliases a ON a.id = m.alias_id
            WHERE t.id = ?1 AND a.user_id = ?2 AND m.is_deleted = FALSE
        "#,
        )
        .bind(attachment)
        .bind(owner)
        .fetch_optional(&self.db.pool)
        .await?;

        row.map(row_to_attachment).transpose()
    }

    /// Clamp page to >= 1 and page size to 1..=max
    fn paging(&self, page: u32, page_size: Option<u32>) -> (u32, u32, i64) {
        let page = page.max(1);
        let page_size = page_size
            .unwrap_or(self.limits.default_page_size)
            .clamp(1, self.limits.max_page_size.max(1));
        let offset = (page as i64 - 1) * page_size as i64;
        (page, page_size, offset)
    }
}

fn push_list_filters(builder: &mut QueryBuilder<'_, Sqlite>, owner: i64, query: &ListQuery) {
    builder.push(" WHERE a.user_id = ");
    builder.push_bind(owner);
    builder.push(" AND m.is_deleted = FALSE");
    if let Some(folder) = query.folder {
        builder.push(" AND m.folder = ");
        builder.push_bind(folder.as_str());
    }
    if let Some(alias_id) = query.alias_id {
        builder.push(" AND m.alias_id = ");
        builder.push_bind(alias_id);
    }
}

fn push_search_base<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    columns: &str,
    fts_query: Option<&str>,
    owner: i64,
    pattern: &str,
) {
    match fts_query {
        Some(expression) => {
            builder.push(
                "WITH fts AS (SELECT rowid AS id, bm25(messages_fts) AS score \
                 FROM messages_fts WHERE messages_fts MATCH ",
            );
            builder.push_bind(expression.to_string());
            builder.push(")");
        }
        // Nothing indexable in the query; only the address matches apply
        None => {
            builder.push("WITH fts AS (SELECT 0 AS id, 0.0 AS score WHERE 0)");
        }
    }

    builder.push(format!(
        " SELECT {} FROM messages m JOIN aliases a ON a.id = m.alias_id \
         LEFT JOIN fts ON fts.id = m.id WHERE a.user_id = ",
        columns
    ));
    builder.push_bind(owner);
    builder.push(" AND m.is_deleted = FALSE AND (fts.id IS NOT NULL OR m.from_addr LIKE ");
    builder.push_bind(pattern.to_string());
    builder.push(
        r" ESCAPE '\' OR EXISTS (SELECT 1 FROM message_recipients r WHERE r.message_id = m.id AND r.address LIKE ",
    );
    builder.push_bind(pattern.to_string());
    builder.push(r" ESCAPE '\'))");
}

/// Turn free text into an FTS5 expression of quoted terms joined by OR.
/// Quoting keeps user input from being read as FTS syntax.
fn fts_match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
