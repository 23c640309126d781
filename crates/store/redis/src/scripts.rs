//! Lua encodings of the [`AtomicOp`](kvsync_store::AtomicOp) contracts.
//!
//! Sharded-queue scripts receive the prefixed queue name as `KEYS[1]` and
//! derive the shard and pointer keys from it.

/// KEYS\[1\] = lock key
/// ARGV\[1\] = token
/// ARGV\[2\] = lease in milliseconds
pub const ACQUIRE_LOCK: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

/// KEYS\[1\] = lock key
/// ARGV\[1\] = token
pub const RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// KEYS\[1\] = timestamp set
/// ARGV\[1\] = token, ARGV\[2\] = limit, ARGV\[3\] = now (ms), ARGV\[4\] = cutoff (ms)
pub const ACQUIRE_SEMAPHORE: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[4])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
if redis.call('ZRANK', KEYS[1], ARGV[1]) < tonumber(ARGV[2]) then
    return ARGV[1]
end
redis.call('ZREM', KEYS[1], ARGV[1])
return false
";

/// KEYS\[1\] = timestamp set
/// ARGV\[1\] = token, ARGV\[2\] = now (ms)
pub const REFRESH_SEMAPHORE: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
return 0
";

/// KEYS\[1\] = timestamp set, KEYS\[2\] = owner set, KEYS\[3\] = counter
/// ARGV\[1\] = token, ARGV\[2\] = limit, ARGV\[3\] = now (ms), ARGV\[4\] = cutoff (ms)
pub const ACQUIRE_FAIR_SEMAPHORE: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[4])
redis.call('ZINTERSTORE', KEYS[2], 2, KEYS[2], KEYS[1], 'WEIGHTS', 1, 0)
local ticket = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
redis.call('ZADD', KEYS[2], ticket, ARGV[1])
if redis.call('ZRANK', KEYS[2], ARGV[1]) < tonumber(ARGV[2]) then
    return ARGV[1]
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return false
";

/// KEYS\[1\] = timestamp set, KEYS\[2\] = owner set
/// ARGV\[1\] = token
pub const RELEASE_FAIR_SEMAPHORE: &str = r"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return removed
";

/// KEYS\[1\] = timestamp set, KEYS\[2\] = owner set
/// ARGV\[1\] = token, ARGV\[2\] = now (ms)
pub const REFRESH_FAIR_SEMAPHORE: &str = r"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) and redis.call('ZSCORE', KEYS[2], ARGV[1]) then
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    return 1
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 0
";

/// KEYS\[1\] = queue name
/// ARGV\[1\] = `head` or `tail`, ARGV\[2\] = chunk size, ARGV\[3..\] = items
pub const SHARDED_PUSH: &str = r"
local count = #ARGV - 2
local chunk = tonumber(ARGV[2])
if count <= 0 or chunk < 2 then
    return 0
end
local pointer, step, push = KEYS[1] .. ':last', 1, 'RPUSH'
if ARGV[1] == 'head' then
    pointer, step, push = KEYS[1] .. ':first', -1, 'LPUSH'
end
local shard = tonumber(redis.call('GET', pointer) or '0')
while true do
    local list = KEYS[1] .. ':' .. shard
    local room = chunk - redis.call('LLEN', list) - 1
    if room > 0 then
        local n = math.min(room, count)
        redis.call(push, list, unpack(ARGV, 3, 2 + n))
        return n
    end
    shard = redis.call('INCRBY', pointer, step)
end
";

/// KEYS\[1\] = queue name
/// ARGV\[1\] = `head` or `tail`
pub const SHARDED_POP: &str = r"
local pointer, other, step, pop = KEYS[1] .. ':last', KEYS[1] .. ':first', -1, 'RPOP'
if ARGV[1] == 'head' then
    pointer, other, step, pop = KEYS[1] .. ':first', KEYS[1] .. ':last', 1, 'LPOP'
end
local shard = tonumber(redis.call('GET', pointer) or '0')
local item = redis.call(pop, KEYS[1] .. ':' .. shard)
if (not item) or redis.call('LLEN', KEYS[1] .. ':' .. shard) == 0 then
    local peer = tonumber(redis.call('GET', other) or '0')
    if shard == peer then
        return item
    end
    shard = redis.call('INCRBY', pointer, step)
    if not item then
        item = redis.call(pop, KEYS[1] .. ':' .. shard)
    end
end
return item
";

/// KEYS\[1\] = queue name
/// ARGV\[1\] = `head` or `tail`, ARGV\[2\] = observed shard, ARGV\[3\] = marker
pub const SHARDED_POP_NUDGE: &str = r"
local pointer, push = KEYS[1] .. ':last', 'RPUSH'
if ARGV[1] == 'head' then
    pointer, push = KEYS[1] .. ':first', 'LPUSH'
end
local shard = tonumber(redis.call('GET', pointer) or '0')
if shard == tonumber(ARGV[2]) then
    return 0
end
redis.call(push, KEYS[1] .. ':' .. ARGV[2], ARGV[3])
return 1
";
