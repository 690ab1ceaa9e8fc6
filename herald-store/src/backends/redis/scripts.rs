use std::sync::LazyLock;

use redis::Script;

/// KEYS: counters. ARGV: limit and ttl millis per counter, interleaved.
/// Returns `{0, 0}` when admitted, otherwise `{index, current}` (1-based).
pub(super) static INCR_WITHIN_LIMITS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
for i = 1, #KEYS do
    local current = tonumber(redis.call('GET', KEYS[i]) or '0')
    if current >= tonumber(ARGV[(i - 1) * 2 + 1]) then
        return {i, current}
    end
end
for i = 1, #KEYS do
    if redis.call('INCR', KEYS[i]) == 1 then
        redis.call('PEXPIRE', KEYS[i], ARGV[(i - 1) * 2 + 2])
    end
end
return {0, 0}
",
    )
});

pub(super) static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

pub(super) static COMPARE_AND_EXPIRE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
",
    )
});
