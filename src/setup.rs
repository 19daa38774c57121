use anyhow::{Context, Result};
use tracing::info;

use crate::db::DbPool;

const CREATE_ROLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS user_roles (
    user_id integer PRIMARY KEY,
    role text NOT NULL CHECK (role IN ('Admin', 'Moderator', 'User'))
)
"#;

/// Existing assignments are kept; only users without one are seeded.
const SEED_ROLES_SQL: &str = r#"
INSERT INTO user_roles (user_id, role)
SELECT id,
       CASE
           WHEN is_superuser THEN 'Admin'
           WHEN is_staff THEN 'Moderator'
           ELSE 'User'
       END
FROM auth_user
ON CONFLICT (user_id) DO NOTHING
"#;

/// Idempotent role bootstrap, run by `pgdash setup-roles`. Returns the
/// number of newly seeded assignments.
pub async fn ensure_role_schema(pool: &DbPool) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to open setup transaction")?;
    sqlx::query(CREATE_ROLES_SQL)
        .execute(&mut *tx)
        .await
        .context("failed to create user_roles")?;
    let seeded = sqlx::query(SEED_ROLES_SQL)
        .execute(&mut *tx)
        .await
        .context("failed to seed user_roles from auth_user")?
        .rows_affected();
    tx.commit().await.context("failed to commit role setup")?;

    info!(seeded, "role schema ready");
    Ok(seeded)
}
