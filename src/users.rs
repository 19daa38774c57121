use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use crate::db::DbPool;
use crate::error::{CoreError, StoreError, ValidationError};
use crate::policy::{AccessGate, Action, Actor, ActorId, Role, RoleFacts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: ActorId,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
}

/// Role assignments keyed by identity-store user id.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// `None` when the user does not exist. Users without an assignment are `User`.
    async fn role_of(&self, user: ActorId) -> Result<Option<Role>, StoreError>;
    async fn admin_count(&self) -> Result<u64, StoreError>;
    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError>;
    /// Refuses with `LastAdmin` when the change would leave no Admin.
    async fn set_role(&self, user: ActorId, role: Role) -> Result<(), StoreError>;
    /// Refuses with `LastAdmin` when the user is the only Admin.
    async fn delete_user(&self, user: ActorId) -> Result<(), StoreError>;
}

const ROLE_OF_SQL: &str = r#"
SELECT COALESCE(ur.role, 'User') AS role
FROM auth_user au
LEFT JOIN user_roles ur ON ur.user_id = au.id
WHERE au.id = $1
"#;

const ADMIN_COUNT_SQL: &str = r#"
SELECT count(*)::bigint
FROM user_roles ur
JOIN auth_user au ON au.id = ur.user_id
WHERE ur.role = 'Admin'
"#;

const LIST_USERS_SQL: &str = r#"
SELECT au.id::bigint AS id,
       au.username,
       NULLIF(au.email, '') AS email,
       COALESCE(ur.role, 'User') AS role
FROM auth_user au
LEFT JOIN user_roles ur ON ur.user_id = au.id
ORDER BY au.id
"#;

const LOCK_ROLES_SQL: &str = "LOCK TABLE user_roles IN SHARE ROW EXCLUSIVE MODE";

/// `user_roles` joined with the identity store's `auth_user`, on the admin pool.
#[derive(Clone)]
pub struct PgRoleStore {
    pool: DbPool,
}

impl PgRoleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn parse_role(raw: &str) -> Result<Role, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Database(format!("unexpected role {raw:?} in user_roles")))
}

/// Locks the role table and checks the target still exists and is not the
/// last Admin being removed.
async fn guard_admin_removal(
    tx: &mut Transaction<'static, Postgres>,
    user: ActorId,
    new_role: Option<Role>,
) -> Result<(), StoreError> {
    sqlx::query(LOCK_ROLES_SQL).execute(&mut **tx).await?;

    let current: Option<String> = sqlx::query_scalar(ROLE_OF_SQL)
        .bind(user)
        .fetch_optional(&mut **tx)
        .await?;
    let current = parse_role(&current.ok_or(StoreError::NotFound(user))?)?;

    if current == Role::Admin && new_role != Some(Role::Admin) {
        let admins: i64 = sqlx::query_scalar(ADMIN_COUNT_SQL)
            .fetch_one(&mut **tx)
            .await?;
        if admins <= 1 {
            return Err(StoreError::LastAdmin);
        }
    }
    Ok(())
}

#[async_trait]
impl RoleStore for PgRoleStore {
    async fn role_of(&self, user: ActorId) -> Result<Option<Role>, StoreError> {
        let role: Option<String> = sqlx::query_scalar(ROLE_OF_SQL)
            .bind(user)
            .fetch_optional(&self.pool)
            .await?;
        role.as_deref().map(parse_role).transpose()
    }

    async fn admin_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(ADMIN_COUNT_SQL)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let rows = sqlx::query(LIST_USERS_SQL).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let role: String = row.try_get("role")?;
                Ok(UserRecord {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    email: row.try_get("email")?,
                    role: parse_role(&role)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn set_role(&self, user: ActorId, role: Role) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        guard_admin_removal(&mut tx, user, Some(role)).await?;
        sqlx::query(
            "INSERT INTO user_roles (user_id, role) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(user)
        .bind(role.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_user(&self, user: ActorId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        guard_admin_removal(&mut tx, user, None).await?;
        sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
            .bind(user)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM auth_user_groups WHERE user_id = $1")
            .bind(user)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM auth_user WHERE id = $1")
            .bind(user)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Resolve the acting user with a role read fresh from the store.
pub async fn load_actor(store: &dyn RoleStore, id: ActorId) -> Result<Option<Actor>, StoreError> {
    Ok(store.role_of(id).await?.map(|role| Actor { id, role }))
}

/// Role management: gate first, then the store.
#[derive(Clone)]
pub struct UserAdmin {
    store: Arc<dyn RoleStore>,
    gate: AccessGate,
}

impl UserAdmin {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self {
            store,
            gate: AccessGate,
        }
    }

    pub async fn load_actor(&self, id: ActorId) -> Result<Option<Actor>, StoreError> {
        load_actor(self.store.as_ref(), id).await
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<UserRecord>, CoreError> {
        self.gate
            .check(actor, &Action::ViewUsers, &RoleFacts::default())?;
        Ok(self.store.list_users().await?)
    }

    #[instrument(skip(self, actor), fields(actor = actor.id))]
    pub async fn change_role(
        &self,
        actor: &Actor,
        target: ActorId,
        new_role: &str,
    ) -> Result<Role, CoreError> {
        let new_role: Role = new_role.parse()?;
        let facts = self.facts(target).await?;
        let decision = self
            .gate
            .check(actor, &Action::ChangeRole { target, new_role }, &facts)
            .inspect_err(|err| {
                info!(target: "audit", actor = actor.id, user = target, reason = %err.reason, "role change denied");
            })?;
        if facts.target_role.is_none() {
            return Err(ValidationError::UnknownUser(target).into());
        }

        debug!(reason = %decision.reason, "role change allowed");
        self.store.set_role(target, new_role).await?;
        info!(target: "audit", actor = actor.id, user = target, role = new_role.as_str(), "role changed");
        Ok(new_role)
    }

    #[instrument(skip(self, actor), fields(actor = actor.id))]
    pub async fn delete(&self, actor: &Actor, target: ActorId) -> Result<(), CoreError> {
        let facts = self.facts(target).await?;
        self.gate
            .check(actor, &Action::DeleteUser { target }, &facts)
            .inspect_err(|err| {
                info!(target: "audit", actor = actor.id, user = target, reason = %err.reason, "user deletion denied");
            })?;
        if facts.target_role.is_none() {
            return Err(ValidationError::UnknownUser(target).into());
        }

        self.store.delete_user(target).await?;
        info!(target: "audit", actor = actor.id, user = target, "user deleted");
        Ok(())
    }

    async fn facts(&self, target: ActorId) -> Result<RoleFacts, StoreError> {
        Ok(RoleFacts {
            admin_count: self.store.admin_count().await?,
            target_role: self.store.role_of(target).await?,
        })
    }
}
