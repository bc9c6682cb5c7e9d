//! Who may move money out of which account on the self-service path.
//!
//! The decision itself is a pure function over an [`ActorContext`] so it can
//! be tested without a database. [`load_actor_tx`] builds the context.

use payloads::{
    AccountOwner, LeagueId, ParticipantId, ParticipantStatus, TeamId, UserId,
};
use sqlx::{Postgres, Transaction};

use super::{StoreError, get_participant_by_user_tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransferDenied {
    #[error("only team directors can transfer from a team account")]
    NotDirector,
    #[error("you are not a director of this team")]
    NotTeamDirector,
    #[error("you can only transfer from your own account")]
    NotAccountOwner,
    #[error("participant is not approved")]
    NotApproved,
    #[error("the system account cannot be used for transfers")]
    SystemAccountForbidden,
}

/// What the store knows about the acting user within one league.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: UserId,
    /// None if the user has no participant record in the league.
    pub participant: Option<(ParticipantId, ParticipantStatus)>,
    pub directed_teams: Vec<TeamId>,
}

pub fn authorize_transfer(
    owner: &AccountOwner,
    actor: &ActorContext,
) -> Result<(), TransferDenied> {
    match owner {
        AccountOwner::Team(team_id) => {
            if actor.directed_teams.is_empty() {
                return Err(TransferDenied::NotDirector);
            }
            if !actor.directed_teams.contains(team_id) {
                return Err(TransferDenied::NotTeamDirector);
            }
            Ok(())
        }
        AccountOwner::Participant(participant_id) => match actor.participant {
            Some((id, status)) if id == *participant_id => {
                if status != ParticipantStatus::Approved {
                    return Err(TransferDenied::NotApproved);
                }
                Ok(())
            }
            _ => Err(TransferDenied::NotAccountOwner),
        },
        AccountOwner::System => Err(TransferDenied::SystemAccountForbidden),
    }
}

pub(crate) async fn load_actor_tx(
    league_id: &LeagueId,
    user_id: &UserId,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<ActorContext, StoreError> {
    let Some(participant) =
        get_participant_by_user_tx(league_id, user_id, tx).await?
    else {
        return Ok(ActorContext {
            user_id: *user_id,
            participant: None,
            directed_teams: Vec::new(),
        });
    };

    let directed_teams: Vec<TeamId> = sqlx::query_scalar(
        r#"
        SELECT team_id
        FROM participant_roles
        WHERE participant_id = $1
          AND role = 'director'
          AND team_id IS NOT NULL
        ORDER BY team_id
        "#,
    )
    .bind(participant.id)
    .fetch_all(&mut **tx)
    .await?;

    Ok(ActorContext {
        user_id: *user_id,
        participant: Some((participant.id, participant.status)),
        directed_teams,
    })
}
