//! Moderator context menus that hand out roles.

use crate::commands::tree::{Access, CommandNode};
use crate::commands::{Invocation, Response};
use crate::db::MessageMetric;
use crate::guild_config::{
    REGULARS_MIN_DAYS_ACTIVE, REGULARS_MIN_DAYS_JOINED, REGULARS_MIN_MESSAGES, REGULARS_ROLE_ID,
    TEMP_ROLE_DURATION_MINUTES, TEMP_ROLE_ID,
};
use crate::messenger::Messenger;
use crate::{handler, vars, Data};
use chrono::{DateTime, Duration, Utc};
use serenity::all::{GuildId, Member, RoleId, UserId};
use tracing::{error, info};

pub fn temp_role_menu() -> CommandNode<Invocation> {
    CommandNode::user_menu("Assign Temporary Role", handler!(assign_temp)).access(Access::Moderator)
}

pub fn regulars_role_menu() -> CommandNode<Invocation> {
    CommandNode::user_menu("Assign Regulars Role", handler!(assign_regulars)).access(Access::Moderator)
}

/// Thresholds a member must meet for the regulars role. Zero disables a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegularsPolicy {
    pub role: RoleId,
    pub min_messages: u64,
    pub min_days_joined: u64,
    pub min_days_active: u64,
}

impl RegularsPolicy {
    /// `None` unless the role is configured with at least one non-zero threshold.
    pub fn load(data: &Data, guild: GuildId) -> Option<Self> {
        let config = &data.guild_config;
        let policy = Self {
            role: config.get(&REGULARS_ROLE_ID, guild).ok()?.role(),
            min_messages: config.get(&REGULARS_MIN_MESSAGES, guild).ok().unwrap_or(0),
            min_days_joined: config.get(&REGULARS_MIN_DAYS_JOINED, guild).ok().unwrap_or(0),
            min_days_active: config.get(&REGULARS_MIN_DAYS_ACTIVE, guild).ok().unwrap_or(0),
        };
        (policy.min_messages > 0 || policy.min_days_joined > 0 || policy.min_days_active > 0).then_some(policy)
    }

    pub fn evaluate(&self, days_joined: u64, metric: &MessageMetric) -> RegularsVerdict {
        if days_joined < self.min_days_joined {
            RegularsVerdict::JoinTimeNotMet { days: days_joined }
        } else if metric.message_count < self.min_messages {
            RegularsVerdict::MessageCountNotMet { min: self.min_messages }
        } else if metric.distinct_days < self.min_days_active {
            RegularsVerdict::DistinctDaysNotMet { min: self.min_days_active }
        } else {
            RegularsVerdict::Eligible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegularsVerdict {
    AlreadyHasRole,
    JoinTimeNotMet { days: u64 },
    MessageCountNotMet { min: u64 },
    DistinctDaysNotMet { min: u64 },
    Eligible,
}

impl RegularsVerdict {
    fn response(self) -> (&'static str, u64) {
        match self {
            RegularsVerdict::AlreadyHasRole => ("roles.alreadyHasRole", 0),
            RegularsVerdict::JoinTimeNotMet { days } => ("roles.regulars.joinTimeNotMet", days),
            RegularsVerdict::MessageCountNotMet { min } => ("roles.regulars.messageCountNotMet", min),
            RegularsVerdict::DistinctDaysNotMet { min } => ("roles.regulars.distinctDaysNotMet", min),
            RegularsVerdict::Eligible => ("roles.regulars.success", 0),
        }
    }
}

/// A member as far as role decisions care.
pub struct MemberSnapshot<'a> {
    pub user: UserId,
    pub roles: &'a [RoleId],
    pub joined_at: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Member> for MemberSnapshot<'a> {
    fn from(member: &'a Member) -> Self {
        Self {
            user: member.user.id,
            roles: &member.roles,
            joined_at: member
                .joined_at
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
        }
    }
}

/// Grants the regulars role when the member qualifies, then forgets their metrics.
///
/// A failed role grant is returned as an error and the metrics are kept.
pub async fn try_grant_regulars(
    data: &Data,
    messenger: &dyn Messenger,
    guild: GuildId,
    policy: &RegularsPolicy,
    member: MemberSnapshot<'_>,
    now: DateTime<Utc>,
) -> anyhow::Result<RegularsVerdict> {
    if member.roles.contains(&policy.role) {
        return Ok(RegularsVerdict::AlreadyHasRole);
    }
    let days_joined = member
        .joined_at
        .map(|joined| (now - joined).num_days().max(0) as u64)
        .unwrap_or(0);
    let guild_key = guild.to_string();
    let user_key = member.user.to_string();
    let metric = data
        .db
        .run_blocking(move |db| db.get_metric(&guild_key, &user_key))
        .await?;

    let verdict = policy.evaluate(days_joined, &metric);
    if verdict != RegularsVerdict::Eligible {
        return Ok(verdict);
    }
    messenger.add_role(guild, member.user, policy.role).await?;
    info!("Granted regulars role to {} in {}", member.user, guild);

    let guild_key = guild.to_string();
    let user_key = member.user.to_string();
    data.db
        .run_blocking(move |db| db.delete_metric(&guild_key, &user_key))
        .await?;
    Ok(verdict)
}

/// The menu target, once it is someone else and the caller is a moderator.
async fn checked_target(call: &Invocation) -> anyhow::Result<Option<UserId>> {
    let target = call
        .target_user()
        .map(|user| user.id)
        .ok_or_else(|| anyhow::anyhow!("target user not resolved"))?;
    if target == call.author().id {
        call.respond(Response::new("roles.self")).await?;
        return Ok(None);
    }
    if !call.actor().moderator {
        call.respond(Response::new("roles.notMod")).await?;
        return Ok(None);
    }
    Ok(Some(target))
}

async fn fetch_member(call: &Invocation, guild: GuildId, user: UserId) -> Option<Member> {
    match guild.member(&call.ctx, user).await {
        Ok(member) => Some(member),
        Err(e) => {
            error!("Failed to fetch member {}: {}", user, e);
            None
        }
    }
}

async fn assign_temp(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let Some(target) = checked_target(&call).await? else {
        return Ok(());
    };
    let role = call.data.guild_config.get(&TEMP_ROLE_ID, guild).ok();
    let expires = call
        .data
        .guild_config
        .get(&TEMP_ROLE_DURATION_MINUTES, guild)
        .ok()
        .and_then(|minutes| i64::try_from(minutes).ok())
        .and_then(Duration::try_minutes)
        .and_then(|duration| Utc::now().checked_add_signed(duration));
    let (Some(role), Some(expires)) = (role, expires) else {
        return call.respond(Response::new("roles.notAvailable")).await;
    };
    let role = role.role();

    let Some(member) = fetch_member(&call, guild, target).await else {
        return call.respond(Response::new("roles.error")).await;
    };
    if member.roles.contains(&role) {
        return call.respond(Response::new("roles.alreadyHasRole")).await;
    }
    if let Err(e) = call.ctx.http.add_member_role(guild, target, role, None).await {
        error!("Failed to add temporary role to {}: {}", target, e);
        return call.respond(Response::new("roles.error")).await;
    }

    let id = call
        .data
        .schedule
        .create_role_removal(guild, target, role, expires)
        .await?;
    info!("Assigned temporary role to {} until {} (task {})", target, expires, id);
    call.respond(Response::new("roles.temp.success").vars(vars! {
        "target" => format!("<@{}>", target),
        "expires" => format!("<t:{}:f>", expires.timestamp()),
    }))
    .await
}

async fn assign_regulars(call: Invocation) -> anyhow::Result<()> {
    let guild = call.guild_id()?;
    let Some(target) = checked_target(&call).await? else {
        return Ok(());
    };
    let Some(policy) = RegularsPolicy::load(&call.data, guild) else {
        return call.respond(Response::new("roles.notAvailable")).await;
    };
    let Some(member) = fetch_member(&call, guild, target).await else {
        return call.respond(Response::new("roles.error")).await;
    };

    let verdict = try_grant_regulars(
        &call.data,
        &*call.ctx.http,
        guild,
        &policy,
        MemberSnapshot::from(&member),
        Utc::now(),
    )
    .await;
    let verdict = match verdict {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("Failed to grant regulars role to {}: {:#}", target, e);
            return call.respond(Response::new("roles.error")).await;
        }
    };
    let (key, value) = verdict.response();
    call.respond(Response::new(key).vars(vars! {
        "target" => format!("<@{}>", target),
        "value" => value,
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::testing::FakeMessenger;
    use crate::test_data;
    use chrono::TimeZone;

    fn policy() -> RegularsPolicy {
        RegularsPolicy {
            role: RoleId::new(9),
            min_messages: 100,
            min_days_joined: 30,
            min_days_active: 5,
        }
    }

    #[test]
    fn test_evaluate_checks_in_order() {
        let policy = policy();
        let busy = MessageMetric {
            message_count: 500,
            distinct_days: 20,
        };
        assert_eq!(policy.evaluate(3, &busy), RegularsVerdict::JoinTimeNotMet { days: 3 });
        assert_eq!(
            policy.evaluate(40, &MessageMetric { message_count: 10, distinct_days: 20 }),
            RegularsVerdict::MessageCountNotMet { min: 100 }
        );
        assert_eq!(
            policy.evaluate(40, &MessageMetric { message_count: 100, distinct_days: 4 }),
            RegularsVerdict::DistinctDaysNotMet { min: 5 }
        );
        assert_eq!(policy.evaluate(30, &busy), RegularsVerdict::Eligible);
    }

    #[test]
    fn test_policy_needs_a_threshold() {
        let data = test_data();
        let guild = GuildId::new(7);
        data.db.set_config(REGULARS_ROLE_ID.name, "7", "\"9\"").unwrap();
        assert_eq!(RegularsPolicy::load(&data, guild), None);

        data.db.set_config(REGULARS_MIN_MESSAGES.name, "7", "3").unwrap();
        data.guild_config.clear();
        let loaded = RegularsPolicy::load(&data, guild).unwrap();
        assert_eq!(loaded.role, RoleId::new(9));
        assert_eq!(loaded.min_messages, 3);
        assert_eq!(loaded.min_days_joined, 0);
    }

    #[tokio::test]
    async fn test_grant_adds_role_and_clears_metrics() {
        let data = test_data();
        let fake = FakeMessenger::default();
        let guild = GuildId::new(7);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let policy = RegularsPolicy {
            role: RoleId::new(9),
            min_messages: 2,
            min_days_joined: 1,
            min_days_active: 1,
        };
        for _ in 0..2 {
            data.db.record_message("7", "42", now).unwrap();
        }

        let member = MemberSnapshot {
            user: UserId::new(42),
            roles: &[],
            joined_at: Some(now - Duration::days(10)),
        };
        let verdict = try_grant_regulars(&data, &fake, guild, &policy, member, now)
            .await
            .unwrap();
        assert_eq!(verdict, RegularsVerdict::Eligible);
        assert_eq!(
            *fake.roles_added.lock().unwrap(),
            vec![(guild, UserId::new(42), RoleId::new(9))]
        );
        assert_eq!(data.db.get_metric("7", "42").unwrap(), MessageMetric::default());

        let holder = MemberSnapshot {
            user: UserId::new(42),
            roles: &[RoleId::new(9)],
            joined_at: None,
        };
        let verdict = try_grant_regulars(&data, &fake, guild, &policy, holder, now)
            .await
            .unwrap();
        assert_eq!(verdict, RegularsVerdict::AlreadyHasRole);
        assert_eq!(fake.roles_added.lock().unwrap().len(), 1);
    }
}
