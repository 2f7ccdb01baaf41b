//! Relational meta fields.
//!
//! Each field kind resolves through one [`RelationResolver`]: local ids become
//! portable natural keys on the authoring site, and natural keys become local ids
//! on the receiving site. References that don't resolve are dropped.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqliteConnection;

use crate::db::{
    find_attachment_by_central_id, find_by_central_marker, find_term, find_user_by_login_or_email,
    get_attachment, get_content, get_term, get_user,
};
use crate::errors::AppError;
use crate::models::{FieldKind, PortableLink, PortableRef, PortableTerm, PortableUser, RelationalField};

/// Sites on both ends of a resolution.
#[derive(Debug, Clone)]
pub struct ResolveContext<'a> {
    /// Site whose ids are read or produced
    pub site_id: i64,
    /// Public URL of the authoring site
    pub source_url: &'a str,
    /// Public URL of the receiving site
    pub local_url: &'a str,
}

#[async_trait]
pub trait RelationResolver: Send + Sync {
    /// Turn a stored local value into portable references.
    async fn to_portable(
        &self,
        conn: &mut SqliteConnection,
        site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError>;

    /// Turn portable references into local values, dropping unresolved ones.
    async fn to_local(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError>;

    /// Human-readable rendering for diffs.
    fn compare_text(&self, refs: &[PortableRef]) -> String;
}

pub fn resolver_for(kind: FieldKind) -> &'static dyn RelationResolver {
    match kind {
        FieldKind::Taxonomy => &TermResolver,
        FieldKind::User => &UserResolver,
        FieldKind::Link => &LinkResolver,
        FieldKind::PostObject | FieldKind::Relationship | FieldKind::PageLink => &PostResolver,
        FieldKind::File | FieldKind::Image | FieldKind::Gallery => &AttachmentResolver,
    }
}

/// Portable form of a stored relational value.
pub async fn portable_field(
    conn: &mut SqliteConnection,
    site_id: i64,
    kind: FieldKind,
    raw: &Value,
) -> Result<RelationalField, AppError> {
    let refs = resolver_for(kind).to_portable(conn, site_id, raw).await?;
    Ok(RelationalField {
        kind,
        multiple: raw.is_array(),
        refs,
    })
}

/// Local value for a portable field. `None` means nothing resolved for a
/// single-valued field and the meta key should be removed.
pub async fn local_value(
    conn: &mut SqliteConnection,
    ctx: &ResolveContext<'_>,
    field: &RelationalField,
) -> Result<Option<Value>, AppError> {
    let values = resolver_for(field.kind)
        .to_local(conn, ctx, &field.refs)
        .await?;
    if field.multiple {
        Ok(Some(Value::Array(values)))
    } else {
        Ok(values.into_iter().next())
    }
}

/// Ids from a stored value: a number, a numeric string, or a list of those.
fn raw_ids(raw: &Value) -> Vec<i64> {
    fn one(v: &Value) -> Option<i64> {
        match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
    match raw {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

pub struct TermResolver;

#[async_trait]
impl RelationResolver for TermResolver {
    async fn to_portable(
        &self,
        conn: &mut SqliteConnection,
        site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError> {
        let mut refs = Vec::new();
        for id in raw_ids(raw) {
            if let Some(term) = get_term(conn, id).await? {
                if term.site_id == site_id {
                    refs.push(PortableRef::Term(PortableTerm {
                        name: term.name,
                        slug: term.slug,
                        taxonomy: term.taxonomy,
                    }));
                }
            }
        }
        Ok(refs)
    }

    async fn to_local(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError> {
        let mut values = Vec::new();
        for r in refs {
            if let PortableRef::Term(term) = r {
                if let Some(local) = find_term(conn, ctx.site_id, &term.taxonomy, &term.slug).await? {
                    values.push(json!(local.id));
                }
            }
        }
        Ok(values)
    }

    fn compare_text(&self, refs: &[PortableRef]) -> String {
        join(refs.iter().filter_map(|r| match r {
            PortableRef::Term(t) => Some(t.name.clone()),
            _ => None,
        }))
    }
}

pub struct UserResolver;

#[async_trait]
impl RelationResolver for UserResolver {
    async fn to_portable(
        &self,
        conn: &mut SqliteConnection,
        _site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError> {
        let mut refs = Vec::new();
        for id in raw_ids(raw) {
            if let Some(user) = get_user(conn, id).await? {
                refs.push(PortableRef::User(PortableUser {
                    login: user.login,
                    email: user.email,
                }));
            }
        }
        Ok(refs)
    }

    async fn to_local(
        &self,
        conn: &mut SqliteConnection,
        _ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError> {
        let mut values = Vec::new();
        for r in refs {
            if let PortableRef::User(user) = r {
                if let Some(local) = find_user_by_login_or_email(conn, &user.login, &user.email).await? {
                    values.push(json!(local.id));
                }
            }
        }
        Ok(values)
    }

    fn compare_text(&self, refs: &[PortableRef]) -> String {
        join(refs.iter().filter_map(|r| match r {
            PortableRef::User(u) => Some(u.login.clone()),
            _ => None,
        }))
    }
}

pub struct LinkResolver;

#[async_trait]
impl RelationResolver for LinkResolver {
    async fn to_portable(
        &self,
        _conn: &mut SqliteConnection,
        _site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError> {
        Ok(serde_json::from_value::<PortableLink>(raw.clone())
            .ok()
            .filter(|link| !link.url.is_empty())
            .map(PortableRef::Link)
            .into_iter()
            .collect())
    }

    async fn to_local(
        &self,
        _conn: &mut SqliteConnection,
        ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError> {
        Ok(refs
            .iter()
            .filter_map(|r| match r {
                PortableRef::Link(link) => Some(json!({
                    "url": link.url.replace(ctx.source_url, ctx.local_url),
                    "title": link.title,
                    "target": link.target,
                })),
                _ => None,
            })
            .collect())
    }

    fn compare_text(&self, refs: &[PortableRef]) -> String {
        join(refs.iter().filter_map(|r| match r {
            PortableRef::Link(l) => Some(format!(
                "Title: {}, URL: {}, Target: {}",
                l.title, l.url, l.target
            )),
            _ => None,
        }))
    }
}

pub struct PostResolver;

#[async_trait]
impl RelationResolver for PostResolver {
    async fn to_portable(
        &self,
        conn: &mut SqliteConnection,
        site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError> {
        let mut refs = Vec::new();
        for id in raw_ids(raw) {
            match get_content(conn, id).await? {
                Some(content) if content.site_id == site_id => refs.push(PortableRef::Post {
                    central_id: content.id,
                    content_type: content.content_type,
                    slug: content.slug,
                }),
                _ => {}
            }
        }
        Ok(refs)
    }

    async fn to_local(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError> {
        let mut values = Vec::new();
        for r in refs {
            if let PortableRef::Post { central_id, .. } = r {
                if let Some(local) = find_by_central_marker(conn, ctx.site_id, *central_id).await? {
                    values.push(json!(local.id));
                }
            }
        }
        Ok(values)
    }

    fn compare_text(&self, refs: &[PortableRef]) -> String {
        join(refs.iter().filter_map(|r| match r {
            PortableRef::Post { slug, .. } => Some(slug.clone()),
            _ => None,
        }))
    }
}

pub struct AttachmentResolver;

#[async_trait]
impl RelationResolver for AttachmentResolver {
    async fn to_portable(
        &self,
        conn: &mut SqliteConnection,
        site_id: i64,
        raw: &Value,
    ) -> Result<Vec<PortableRef>, AppError> {
        let mut refs = Vec::new();
        for id in raw_ids(raw) {
            match get_attachment(conn, id).await? {
                Some(attachment) if attachment.site_id == site_id => {
                    refs.push(PortableRef::Attachment {
                        central_id: attachment.id,
                        url: attachment.url,
                    })
                }
                _ => {}
            }
        }
        Ok(refs)
    }

    async fn to_local(
        &self,
        conn: &mut SqliteConnection,
        ctx: &ResolveContext<'_>,
        refs: &[PortableRef],
    ) -> Result<Vec<Value>, AppError> {
        let mut values = Vec::new();
        for r in refs {
            if let PortableRef::Attachment { central_id, .. } = r {
                if let Some(local) = find_attachment_by_central_id(conn, ctx.site_id, *central_id).await? {
                    values.push(json!(local.id));
                }
            }
        }
        Ok(values)
    }

    fn compare_text(&self, refs: &[PortableRef]) -> String {
        join(refs.iter().filter_map(|r| match r {
            PortableRef::Attachment { url, .. } => Some(url.clone()),
            _ => None,
        }))
    }
}

fn join(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(", ")
}
