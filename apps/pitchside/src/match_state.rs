//! Typed access to the replicated `match_state` collection.
//!
//! Each player side owns one document keyed by its participant id. Every
//! update rewrites that whole document, which is also the unit the peer
//! receives.

use serde::{Deserialize, Serialize};

use crate::identity::ParticipantId;
use crate::store::{Collection, CollectionSchema, Query, Store, StoreError};

pub const MATCH_STATE_COLLECTION: &str = "match_state";

pub fn schema() -> CollectionSchema {
    CollectionSchema::new(MATCH_STATE_COLLECTION).with_index("guild")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub health: u32,
}

impl RosterEntry {
    pub fn new(name: impl Into<String>, health: u32) -> Self {
        Self {
            name: name.into(),
            health,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStateDocument {
    pub player: ParticipantId,
    #[serde(default)]
    pub guild: Option<String>,
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub momentum: u32,
    /// Screen this side wants to move to; both must agree before either does.
    #[serde(default)]
    pub navigate_to: Option<String>,
}

impl MatchStateDocument {
    pub fn new(player: ParticipantId) -> Self {
        Self {
            player,
            guild: None,
            roster: Vec::new(),
            score: 0,
            momentum: 0,
            navigate_to: None,
        }
    }

    pub fn model(&self, name: &str) -> Option<&RosterEntry> {
        self.roster.iter().find(|entry| entry.name == name)
    }
}

#[derive(Clone)]
pub struct MatchState {
    collection: Collection,
}

impl MatchState {
    pub async fn open(store: &Store) -> Result<Self, StoreError> {
        Ok(Self {
            collection: store.collection(schema()).await?,
        })
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Create this player's document if it does not exist yet.
    pub async fn claim_side(&self, player: ParticipantId) -> Result<MatchStateDocument, StoreError> {
        if let Some(existing) = self.side(player).await? {
            return Ok(existing);
        }
        let doc = MatchStateDocument::new(player);
        self.collection
            .upsert_value(&player.to_string(), &doc)
            .await?;
        Ok(doc)
    }

    pub async fn side(&self, player: ParticipantId) -> Result<Option<MatchStateDocument>, StoreError> {
        self.collection
            .find_one(&player.to_string())
            .await?
            .map(|doc| doc.decode())
            .transpose()
    }

    pub async fn sides(&self) -> Result<Vec<MatchStateDocument>, StoreError> {
        self.collection
            .all()
            .await?
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    pub async fn opponent(&self, player: ParticipantId) -> Result<Option<MatchStateDocument>, StoreError> {
        Ok(self
            .sides()
            .await?
            .into_iter()
            .find(|side| side.player != player))
    }

    pub async fn playing_guild(&self, guild: &str) -> Result<Vec<MatchStateDocument>, StoreError> {
        self.collection
            .find(&Query::all().where_eq("guild", guild))
            .await?
            .iter()
            .map(|doc| doc.decode())
            .collect()
    }

    pub async fn select_guild(
        &self,
        player: ParticipantId,
        guild: impl Into<String>,
    ) -> Result<MatchStateDocument, StoreError> {
        let guild = guild.into();
        self.update(player, |doc| {
            doc.guild = Some(guild);
            Ok(())
        })
        .await
    }

    pub async fn set_roster(
        &self,
        player: ParticipantId,
        roster: Vec<RosterEntry>,
    ) -> Result<MatchStateDocument, StoreError> {
        self.update(player, |doc| {
            doc.roster = roster;
            Ok(())
        })
        .await
    }

    pub async fn set_health(
        &self,
        player: ParticipantId,
        model: &str,
        health: u32,
    ) -> Result<MatchStateDocument, StoreError> {
        self.update(player, |doc| {
            roster_entry(doc, model)?.health = health;
            Ok(())
        })
        .await
    }

    /// Add `delta` to a model's health, stopping at zero.
    pub async fn adjust_health(
        &self,
        player: ParticipantId,
        model: &str,
        delta: i32,
    ) -> Result<u32, StoreError> {
        let doc = self
            .update(player, |doc| {
                let entry = roster_entry(doc, model)?;
                entry.health = entry.health.saturating_add_signed(delta);
                Ok(())
            })
            .await?;
        Ok(doc.model(model).map(|entry| entry.health).unwrap_or_default())
    }

    pub async fn set_score(&self, player: ParticipantId, score: u32) -> Result<MatchStateDocument, StoreError> {
        self.update(player, |doc| {
            doc.score = score;
            Ok(())
        })
        .await
    }

    pub async fn set_momentum(
        &self,
        player: ParticipantId,
        momentum: u32,
    ) -> Result<MatchStateDocument, StoreError> {
        self.update(player, |doc| {
            doc.momentum = momentum;
            Ok(())
        })
        .await
    }

    pub async fn navigate_to(
        &self,
        player: ParticipantId,
        screen: impl Into<String>,
    ) -> Result<MatchStateDocument, StoreError> {
        let screen = screen.into();
        self.update(player, |doc| {
            doc.navigate_to = Some(screen);
            Ok(())
        })
        .await
    }

    /// True once both sides exist and both point at `screen`.
    pub async fn both_reached(&self, screen: &str) -> Result<bool, StoreError> {
        let sides = self.sides().await?;
        Ok(sides.len() == 2
            && sides
                .iter()
                .all(|side| side.navigate_to.as_deref() == Some(screen)))
    }

    async fn update(
        &self,
        player: ParticipantId,
        change: impl FnOnce(&mut MatchStateDocument) -> Result<(), StoreError>,
    ) -> Result<MatchStateDocument, StoreError> {
        self.collection
            .update_value(&player.to_string(), change)
            .await
    }
}

fn roster_entry<'a>(doc: &'a mut MatchStateDocument, model: &str) -> Result<&'a mut RosterEntry, StoreError> {
    doc.roster
        .iter_mut()
        .find(|entry| entry.name == model)
        .ok_or_else(|| StoreError::NotFound(model.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn match_state() -> MatchState {
        MatchState::open(&Store::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn document_uses_camel_case_fields() {
        let player = ParticipantId::new_random();
        let mut doc = MatchStateDocument::new(player);
        doc.navigate_to = Some("Draft".into());
        doc.roster.push(RosterEntry::new("Tenderiser", 18));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["navigateTo"], json!("Draft"));
        assert_eq!(value["roster"], json!([{"name": "Tenderiser", "health": 18}]));
        assert_eq!(value["player"], json!(player.to_string()));
    }

    #[tokio::test]
    async fn claim_side_is_idempotent() {
        let state = match_state().await;
        let player = ParticipantId::new_random();
        state.claim_side(player).await.unwrap();
        state.set_score(player, 4).await.unwrap();
        let again = state.claim_side(player).await.unwrap();
        assert_eq!(again.score, 4);
    }

    #[tokio::test]
    async fn adjust_health_saturates_at_zero() {
        let state = match_state().await;
        let player = ParticipantId::new_random();
        state.claim_side(player).await.unwrap();
        state
            .set_roster(player, vec![RosterEntry::new("Boiler", 16), RosterEntry::new("Meathook", 12)])
            .await
            .unwrap();

        assert_eq!(state.adjust_health(player, "Boiler", -4).await.unwrap(), 12);
        assert_eq!(state.adjust_health(player, "Meathook", -20).await.unwrap(), 0);
        assert_eq!(state.adjust_health(player, "Meathook", 3).await.unwrap(), 3);

        let err = state.adjust_health(player, "Nobody", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(name) if name == "Nobody"));
    }

    #[tokio::test]
    async fn overlapping_adjustments_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let state = MatchState::open(&Store::open(dir.path()).await.unwrap())
            .await
            .unwrap();
        let player = ParticipantId::new_random();
        state.claim_side(player).await.unwrap();
        state
            .set_roster(player, vec![RosterEntry::new("Boiler", 16)])
            .await
            .unwrap();

        let hits = (0..10).map(|_| state.adjust_health(player, "Boiler", -1));
        for result in futures_util::future::join_all(hits).await {
            result.unwrap();
        }
        let side = state.side(player).await.unwrap().unwrap();
        assert_eq!(side.model("Boiler").map(|entry| entry.health), Some(6));
    }

    #[tokio::test]
    async fn updates_require_a_claimed_side() {
        let state = match_state().await;
        let err = state
            .set_score(ParticipantId::new_random(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn navigation_waits_for_both_sides() {
        let state = match_state().await;
        let host = ParticipantId::new_random();
        let guest = ParticipantId::new_random();
        state.claim_side(host).await.unwrap();
        state.navigate_to(host, "Draft").await.unwrap();
        assert!(!state.both_reached("Draft").await.unwrap());

        state.claim_side(guest).await.unwrap();
        assert!(!state.both_reached("Draft").await.unwrap());
        state.navigate_to(guest, "Draft").await.unwrap();
        assert!(state.both_reached("Draft").await.unwrap());
        assert!(!state.both_reached("Game").await.unwrap());

        assert_eq!(state.opponent(host).await.unwrap().map(|s| s.player), Some(guest));
    }

    #[tokio::test]
    async fn guild_lookup_uses_the_index() {
        let state = match_state().await;
        let host = ParticipantId::new_random();
        let guest = ParticipantId::new_random();
        state.claim_side(host).await.unwrap();
        state.claim_side(guest).await.unwrap();
        state.select_guild(host, "Masons").await.unwrap();
        state.select_guild(guest, "Brewers").await.unwrap();

        let masons = state.playing_guild("Masons").await.unwrap();
        assert_eq!(masons.len(), 1);
        assert_eq!(masons[0].player, host);
    }
}
