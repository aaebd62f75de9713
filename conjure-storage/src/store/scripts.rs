//! Lua scripts backing the atomic store units.
//!
//! Each script runs as a single command on the store, so no other client can
//! observe its intermediate state. All keys a script touches share one hash
//! tag; callers check this before invoking.

use once_cell::sync::Lazy;
use redis::Script;

/// KEYS: schemes set, conjunction set.
/// ARGV: scheme, cache key, entry timeout secs (0 disables extension), extended TTL secs.
const REGISTER_CONJUNCTION: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])

local timeout = tonumber(ARGV[3])
if timeout > 0 then
    local remaining = redis.call('TTL', KEYS[2])
    if remaining < timeout then
        redis.call('EXPIRE', KEYS[2], ARGV[4])
    end
end
return 1
"#;

/// KEYS: index sets (first ARGV[1] keys), then extra keys to drop.
/// ARGV: number of index sets.
///
/// Returns the number of member keys deleted.
const DELETE_UNION: &str = r#"
local n = tonumber(ARGV[1])
local index_keys = {}
for i = 1, n do
    index_keys[i] = KEYS[i]
end

local members = redis.call('SUNION', unpack(index_keys))
local removed = 0
for i = 1, #members, 1000 do
    local chunk = {}
    for j = i, math.min(i + 999, #members) do
        chunk[#chunk + 1] = members[j]
    end
    removed = removed + redis.call('DEL', unpack(chunk))
end

redis.call('DEL', unpack(KEYS))
return removed
"#;

/// KEYS: lock key, signal list. ARGV: sentinel, lock TTL secs.
const TRY_LOCK: &str = r#"
local locked = redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2])
if locked then
    redis.call('DEL', KEYS[2])
    return 1
end
return 0
"#;

/// KEYS: lock key, signal list. ARGV: sentinel, signal TTL secs.
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
redis.call('LPUSH', KEYS[2], 1)
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
"#;

/// KEYS: conjunction set, then the member keys to check.
///
/// Returns `{processed, removed, set_deleted, bytes_freed}`.
const PRUNE_SET: &str = r#"
local removed = 0
local bytes = 0
for i = 2, #KEYS do
    if redis.call('EXISTS', KEYS[i]) == 0 then
        if redis.call('SREM', KEYS[1], KEYS[i]) == 1 then
            removed = removed + 1
            bytes = bytes + string.len(KEYS[i])
        end
    end
end

local deleted = 0
if removed > 0 and redis.call('EXISTS', KEYS[1]) == 0 then
    deleted = 1
end
return {#KEYS - 1, removed, deleted, bytes}
"#;

pub(crate) static REGISTER_CONJUNCTION_SCRIPT: Lazy<Script> =
    Lazy::new(|| Script::new(REGISTER_CONJUNCTION));
pub(crate) static DELETE_UNION_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(DELETE_UNION));
pub(crate) static TRY_LOCK_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(TRY_LOCK));
pub(crate) static RELEASE_LOCK_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(RELEASE_LOCK));
pub(crate) static PRUNE_SET_SCRIPT: Lazy<Script> = Lazy::new(|| Script::new(PRUNE_SET));
