use async_trait::async_trait;
use common::RetryPolicy;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RepoError;
use crate::model::{Derivative, StoredFile};

/// Row-level access to derivative records inside one unit of work.
#[async_trait]
pub trait DerivativeRows: Send {
    async fn find_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
    ) -> Result<Option<Derivative>, RepoError>;

    /// Insert a new row. Fails with [`RepoError::UniqueViolation`] when a row
    /// for (asset_id, key) already exists.
    async fn insert_derivative(
        &mut self,
        asset_id: Uuid,
        key: &str,
        file: &StoredFile,
    ) -> Result<Derivative, RepoError>;

    /// Point an existing row at a new file. `None` if the row is gone.
    async fn update_derivative_file(
        &mut self,
        id: Uuid,
        file: &StoredFile,
    ) -> Result<Option<Derivative>, RepoError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpsertOutcome {
    Created(Derivative),
    Updated {
        derivative: Derivative,
        previous: StoredFile,
    },
    /// Every attempt collided with a concurrent insert.
    Exhausted { attempts: u32 },
}

/// Create or update the derivative row for (asset_id, key).
///
/// Each attempt looks the row up and updates it in place; if there is none it
/// inserts. An insert that loses to a concurrent insert reports a uniqueness
/// violation, and the next attempt finds the winner's row and updates it.
pub async fn upsert_derivative<R>(
    rows: &mut R,
    asset_id: Uuid,
    key: &str,
    file: &StoredFile,
    policy: &RetryPolicy,
) -> Result<UpsertOutcome, RepoError>
where
    R: DerivativeRows + ?Sized,
{
    let attempts = policy.attempts();
    for attempt in 1..=attempts {
        if let Some(existing) = rows.find_derivative(asset_id, key).await? {
            match rows.update_derivative_file(existing.id, file).await? {
                Some(derivative) => {
                    return Ok(UpsertOutcome::Updated {
                        derivative,
                        previous: existing.file,
                    });
                }
                None => {
                    debug!(%asset_id, key, attempt, "Derivative row vanished before update");
                    continue;
                }
            }
        }

        match rows.insert_derivative(asset_id, key, file).await {
            Ok(derivative) => return Ok(UpsertOutcome::Created(derivative)),
            Err(RepoError::UniqueViolation { .. }) => {
                warn!(%asset_id, key, attempt, "Derivative insert lost a uniqueness race");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(UpsertOutcome::Exhausted { attempts })
}
