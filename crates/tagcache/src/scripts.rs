//! Lua scripts and invocation plumbing
//!
//! Scripts run through [`redis::Script`], which hashes the text once and
//! issues `EVALSHA`, falling back to `EVAL` when the server replies
//! `NOSCRIPT`. Scripts are only used on standalone deployments; cluster
//! paths serialize the same sequences as node-local commands.
//!
//! `any`-mode scripts receive exactly the two keys known to hash together
//! (the entry key and its reverse index, or the interleaved list of both
//! for bulk writes). Every other key is rebuilt inside Lua from the
//! `ARGV`-passed prefixes, and every value in `ARGV` is pre-serialized.

use sha1::{Digest, Sha1};

/// Untagged `add`: insert only when absent. The text is fixed; changing a
/// byte changes the script hash registered on every server.
pub const ADD: &str =
    "return redis.call('exists',KEYS[1])<1 and redis.call('setex',KEYS[1],ARGV[2],ARGV[1])";

/// `any`-mode tagged put (and `forever` via `ttl = 0`).
///
/// KEYS: [entry, reverse_index]
/// ARGV: [value, ttl, tag_prefix, entry_prefix, now, tag...]
pub const ANY_PUT: &str = r#"
local entry = KEYS[1]
local rindex = KEYS[2]
local value = ARGV[1]
local ttl = tonumber(ARGV[2])
local tagprefix = ARGV[3]
local entryprefix = ARGV[4]
local now = tonumber(ARGV[5])
local registry = tagprefix .. 'registry'
local barekey = string.sub(entry, string.len(entryprefix) + 1)
local expiry = 253402300799
if ttl > 0 then
    expiry = now + ttl
end

local old = redis.call('smembers', rindex)
local fresh = {}
for i = 6, #ARGV do
    fresh[ARGV[i]] = true
end

if ttl > 0 then
    redis.call('setex', entry, ttl, value)
else
    redis.call('set', entry, value)
end

for _, tag in ipairs(old) do
    if not fresh[tag] then
        redis.call('hdel', tagprefix .. tag .. ':entries', barekey)
    end
end

redis.call('del', rindex)
for i = 6, #ARGV do
    local tag = ARGV[i]
    local hash = tagprefix .. tag .. ':entries'
    if ttl > 0 then
        redis.call('hsetex', hash, 'EX', ttl, 'FVS', 1, barekey, '1')
    else
        redis.call('hsetex', hash, 'FVS', 1, barekey, '1')
    end
    redis.call('sadd', rindex, tag)
    redis.call('zadd', registry, 'GT', expiry, tag)
end
if ttl > 0 then
    redis.call('expire', rindex, ttl)
end
return 1
"#;

/// `any`-mode tagged add: the `exists` guard short-circuits the whole
/// write when the key is already present.
///
/// KEYS: [entry, reverse_index]
/// ARGV: [value, ttl, tag_prefix, entry_prefix, now, tag...]
pub const ANY_ADD: &str = r#"
local entry = KEYS[1]
if redis.call('exists', entry) >= 1 then
    return 0
end
local rindex = KEYS[2]
local value = ARGV[1]
local ttl = tonumber(ARGV[2])
local tagprefix = ARGV[3]
local entryprefix = ARGV[4]
local now = tonumber(ARGV[5])
local registry = tagprefix .. 'registry'
local barekey = string.sub(entry, string.len(entryprefix) + 1)
local expiry = 253402300799
if ttl > 0 then
    expiry = now + ttl
end

local old = redis.call('smembers', rindex)
local fresh = {}
for i = 6, #ARGV do
    fresh[ARGV[i]] = true
end

if ttl > 0 then
    redis.call('setex', entry, ttl, value)
else
    redis.call('set', entry, value)
end

for _, tag in ipairs(old) do
    if not fresh[tag] then
        redis.call('hdel', tagprefix .. tag .. ':entries', barekey)
    end
end

redis.call('del', rindex)
for i = 6, #ARGV do
    local tag = ARGV[i]
    local hash = tagprefix .. tag .. ':entries'
    if ttl > 0 then
        redis.call('hsetex', hash, 'EX', ttl, 'FVS', 1, barekey, '1')
    else
        redis.call('hsetex', hash, 'FVS', 1, barekey, '1')
    end
    redis.call('sadd', rindex, tag)
    redis.call('zadd', registry, 'GT', expiry, tag)
end
if ttl > 0 then
    redis.call('expire', rindex, ttl)
end
return 1
"#;

/// `any`-mode bulk put: the single-entry sequence once per entry.
///
/// KEYS: [entry1, rindex1, entry2, rindex2, ...]
/// ARGV: [ttl, tag_prefix, entry_prefix, now, ntags, tag..., value...]
/// with one value per entry pair, in `KEYS` order.
pub const ANY_PUT_MANY: &str = r#"
local ttl = tonumber(ARGV[1])
local tagprefix = ARGV[2]
local entryprefix = ARGV[3]
local now = tonumber(ARGV[4])
local ntags = tonumber(ARGV[5])
local registry = tagprefix .. 'registry'
local expiry = 253402300799
if ttl > 0 then
    expiry = now + ttl
end

local fresh = {}
for i = 6, 5 + ntags do
    fresh[ARGV[i]] = true
end

local npairs = #KEYS / 2
for p = 1, npairs do
    local entry = KEYS[p * 2 - 1]
    local rindex = KEYS[p * 2]
    local value = ARGV[5 + ntags + p]
    local barekey = string.sub(entry, string.len(entryprefix) + 1)

    local old = redis.call('smembers', rindex)

    if ttl > 0 then
        redis.call('setex', entry, ttl, value)
    else
        redis.call('set', entry, value)
    end

    for _, tag in ipairs(old) do
        if not fresh[tag] then
            redis.call('hdel', tagprefix .. tag .. ':entries', barekey)
        end
    end

    redis.call('del', rindex)
    for i = 6, 5 + ntags do
        local tag = ARGV[i]
        local hash = tagprefix .. tag .. ':entries'
        if ttl > 0 then
            redis.call('hsetex', hash, 'EX', ttl, 'FVS', 1, barekey, '1')
        else
            redis.call('hsetex', hash, 'FVS', 1, barekey, '1')
        end
        redis.call('sadd', rindex, tag)
        redis.call('zadd', registry, 'GT', expiry, tag)
    end
    if ttl > 0 then
        redis.call('expire', rindex, ttl)
    end
end
return npairs
"#;

/// `any`-mode counter update. `INCRBY` first (negative deltas decrement),
/// then the key's remaining TTL is propagated to the tag references. The
/// reverse index is merged, not rebuilt: a counter update must not drop
/// tags recorded by an earlier write.
///
/// KEYS: [entry, reverse_index]
/// ARGV: [by, tag_prefix, entry_prefix, now, tag...]
pub const ANY_INCR: &str = r#"
local entry = KEYS[1]
local rindex = KEYS[2]
local by = tonumber(ARGV[1])
local tagprefix = ARGV[2]
local entryprefix = ARGV[3]
local now = tonumber(ARGV[4])
local registry = tagprefix .. 'registry'
local barekey = string.sub(entry, string.len(entryprefix) + 1)

local current = redis.call('incrby', entry, by)
local ttl = redis.call('ttl', entry)
local expiry = 253402300799
if ttl > 0 then
    expiry = now + ttl
end

for i = 5, #ARGV do
    local tag = ARGV[i]
    local hash = tagprefix .. tag .. ':entries'
    if ttl > 0 then
        redis.call('hsetex', hash, 'EX', ttl, 'FVS', 1, barekey, '1')
    else
        redis.call('hsetex', hash, 'FVS', 1, barekey, '1')
    end
    redis.call('sadd', rindex, tag)
    redis.call('zadd', registry, 'GT', expiry, tag)
end
if ttl > 0 then
    redis.call('expire', rindex, ttl)
end
return current
"#;

/// Hex SHA-1 of a script text, as registered by `SCRIPT LOAD`.
pub fn script_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
