//! # Redis
//!
//! Document store for voters, polls and the admin set.
//!
//! ## Layout
//!
//! - `voters`: set of voter ids
//! - `voter:<id>`: hash, `record` holds the voter JSON and every `ballot:<poll>` field holds
//!   one ballot JSON, so a ballot is updated without rewriting its siblings
//! - `admins`: set of voter ids with the admin capability
//! - `polls`: set of poll ids, `polls:next_id` the id counter
//! - `poll:<id>`: poll JSON (title, status, candidates)
//! - `poll:<id>:votes`: hash of candidate id to approved votes, bumped with `HINCRBY`
//!
//! ## Atomicity
//!
//! Ballot writes go through a Lua script comparing the stored ballot with the expected one
//! before writing, Redis runs scripts without interleaving other commands. Counters use
//! Redis' own atomic increment so concurrent approvals never lose an update.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use ledger::{
    StoreError,
    model::{Ballot, CandidateId, Poll, PollId, PollStatus, VoterRecord},
    ports::{ChangeEvent, DocumentStore, Subscription},
};
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::sync::broadcast;
use tracing::info;

const VOTERS: &str = "voters";
const ADMINS: &str = "admins";
const POLLS: &str = "polls";
const POLL_COUNTER: &str = "polls:next_id";
const RECORD_FIELD: &str = "record";
const BALLOT_PREFIX: &str = "ballot:";
const CHANGE_CAPACITY: usize = 256;

/// KEYS[1] voter hash, ARGV[1] ballot field, ARGV[2] expected JSON ('' for none),
/// ARGV[3] next JSON. Returns -1 for a missing voter, 0 when the ballot moved, 1 on write.
const UPDATE_BALLOT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local current = redis.call('HGET', KEYS[1], ARGV[1])
if (current == false and ARGV[2] == '') or current == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    client.get_connection_manager_with_config(config).await
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn voter_key(id: &str) -> String {
    format!("voter:{id}")
}

fn ballot_field(poll_id: &str) -> String {
    format!("{BALLOT_PREFIX}{poll_id}")
}

fn poll_key(id: &str) -> String {
    format!("poll:{id}")
}

fn votes_key(id: &str) -> String {
    format!("poll:{id}:votes")
}

pub struct RedisStore {
    connection: ConnectionManager,
    update_ballot: Script,
    changes: broadcast::Sender<ChangeEvent>,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        Self {
            connection,
            update_ballot: Script::new(UPDATE_BALLOT),
            changes,
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let connection = init_redis(redis_url).await.map_err(unavailable)?;
        info!("Connected to Redis");

        Ok(Self::new(connection))
    }

    pub async fn add_admin(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(ADMINS, id)
            .await
            .map_err(unavailable)
    }

    fn notify(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    async fn poll_votes(&self, id: &str) -> Result<HashMap<String, u32>, StoreError> {
        let mut conn = self.connection.clone();
        conn.hgetall(votes_key(id)).await.map_err(unavailable)
    }
}

/// Rebuilds a voter from its hash fields.
fn parse_voter(fields: HashMap<String, String>) -> Result<Option<VoterRecord>, StoreError> {
    let Some(record) = fields.get(RECORD_FIELD) else {
        return Ok(None);
    };

    let mut voter: VoterRecord = serde_json::from_str(record)?;
    for (field, value) in &fields {
        if let Some(poll_id) = field.strip_prefix(BALLOT_PREFIX) {
            voter
                .ballots
                .insert(poll_id.to_string(), serde_json::from_str(value)?);
        }
    }

    Ok(Some(voter))
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn voter(&self, id: &str) -> Result<Option<VoterRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(voter_key(id)).await.map_err(unavailable)?;

        parse_voter(fields)
    }

    async fn create_voter(&self, record: &VoterRecord) -> Result<(), StoreError> {
        let mut header = record.clone();
        let ballots = std::mem::take(&mut header.ballots);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(voter_key(&record.id), RECORD_FIELD, serde_json::to_string(&header)?)
            .ignore()
            .sadd(VOTERS, &record.id)
            .ignore();

        for (poll_id, ballot) in &ballots {
            pipe.hset(
                voter_key(&record.id),
                ballot_field(poll_id),
                serde_json::to_string(ballot)?,
            )
            .ignore();
        }

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)?;

        self.notify(ChangeEvent::Voter(record.id.clone()));
        Ok(())
    }

    async fn voters(&self) -> Result<Vec<VoterRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let mut ids: Vec<String> = conn.smembers(VOTERS).await.map_err(unavailable)?;
        ids.sort();

        let mut voters = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(voter) = self.voter(&id).await? {
                voters.push(voter);
            }
        }

        Ok(voters)
    }

    async fn update_ballot(
        &self,
        voter_id: &str,
        poll_id: &str,
        expected: Option<&Ballot>,
        next: &Ballot,
    ) -> Result<bool, StoreError> {
        let expected = match expected {
            Some(ballot) => serde_json::to_string(ballot)?,
            None => String::new(),
        };

        let mut conn = self.connection.clone();
        let outcome: i64 = self
            .update_ballot
            .key(voter_key(voter_id))
            .arg(ballot_field(poll_id))
            .arg(expected)
            .arg(serde_json::to_string(next)?)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match outcome {
            -1 => Err(StoreError::Missing(format!("voters/{voter_id}"))),
            0 => Ok(false),
            _ => {
                self.notify(ChangeEvent::Voter(voter_id.to_string()));
                Ok(true)
            }
        }
    }

    async fn is_admin(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        conn.sismember(ADMINS, id).await.map_err(unavailable)
    }

    async fn allocate_poll_id(&self) -> Result<PollId, StoreError> {
        let mut conn = self.connection.clone();
        let id: u64 = conn.incr(POLL_COUNTER, 1).await.map_err(unavailable)?;

        Ok(format!("poll_{id}"))
    }

    async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        let votes: Vec<(&str, u32)> = poll
            .candidates
            .iter()
            .map(|c| (c.id.as_str(), c.approved_votes))
            .collect();

        let mut conn = self.connection.clone();
        redis::pipe()
            .atomic()
            .set(poll_key(&poll.id), serde_json::to_string(poll)?)
            .ignore()
            .hset_multiple(votes_key(&poll.id), &votes)
            .ignore()
            .sadd(POLLS, &poll.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(unavailable)?;

        self.notify(ChangeEvent::Poll(poll.id.clone()));
        Ok(())
    }

    async fn poll(&self, id: &str) -> Result<Option<Poll>, StoreError> {
        let mut conn = self.connection.clone();
        let Some(json) = conn
            .get::<_, Option<String>>(poll_key(id))
            .await
            .map_err(unavailable)?
        else {
            return Ok(None);
        };

        let mut poll: Poll = serde_json::from_str(&json)?;
        let votes = self.poll_votes(id).await?;
        for candidate in &mut poll.candidates {
            candidate.approved_votes = votes.get(&candidate.id).copied().unwrap_or(0);
        }

        Ok(Some(poll))
    }

    async fn polls(&self, status: Option<PollStatus>) -> Result<Vec<Poll>, StoreError> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = conn.smembers(POLLS).await.map_err(unavailable)?;

        let mut polls = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(poll) = self.poll(&id).await? {
                if status.is_none_or(|status| poll.status == status) {
                    polls.push(poll);
                }
            }
        }

        polls.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(polls)
    }

    async fn set_poll_status(&self, poll_id: &str, status: PollStatus) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn.get(poll_key(poll_id)).await.map_err(unavailable)?;
        let json = json.ok_or_else(|| StoreError::Missing(format!("polls/{poll_id}")))?;

        let mut poll: Poll = serde_json::from_str(&json)?;
        poll.status = status;

        conn.set::<_, _, ()>(poll_key(poll_id), serde_json::to_string(&poll)?)
            .await
            .map_err(unavailable)?;

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(())
    }

    async fn increment_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
    ) -> Result<u32, StoreError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn
            .hexists(votes_key(poll_id), candidate_id)
            .await
            .map_err(unavailable)?;
        if !exists {
            return Err(StoreError::Missing(format!("polls/{poll_id}/{candidate_id}")));
        }

        let votes: u32 = conn
            .hincr(votes_key(poll_id), candidate_id, 1)
            .await
            .map_err(unavailable)?;

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(votes)
    }

    async fn set_votes(
        &self,
        poll_id: &str,
        candidate_id: &CandidateId,
        votes: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.hset::<_, _, _, ()>(votes_key(poll_id), candidate_id, votes)
            .await
            .map_err(unavailable)?;

        self.notify(ChangeEvent::Poll(poll_id.to_string()));
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.changes.subscribe())
    }
}
