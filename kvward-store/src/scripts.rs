//! Lua sources for the store's scripted operations.
//!
//! Redis runs each script without interleaving other commands, which is what
//! makes compare-and-delete and reserve indivisible. The in-memory backend
//! implements the same semantics natively under its single lock.

/// Delete `KEYS[1]` only if it holds `ARGV[1]`.
///
/// Returns 1 when deleted, 0 otherwise.
pub const UNLOCK_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Reserve one unit of stock for a member.
///
/// `KEYS[1]` stock counter, `KEYS[2]` purchaser set, `ARGV[1]` member.
///
/// Returns 0 reserved, 1 sold out (missing or non-positive stock),
/// 2 duplicate member.
pub const RESERVE_SCRIPT: &str = r"
local stock = tonumber(redis.call('GET', KEYS[1]))
if stock == nil or stock <= 0 then
    return 1
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
    return 2
end
redis.call('INCRBY', KEYS[1], -1)
redis.call('SADD', KEYS[2], ARGV[1])
return 0
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_script_compares_before_delete() {
        let get = UNLOCK_SCRIPT.find("'GET'").unwrap();
        let del = UNLOCK_SCRIPT.find("'DEL'").unwrap();
        assert!(get < del);
    }

    #[test]
    fn test_reserve_script_checks_before_mutating() {
        let stock_check = RESERVE_SCRIPT.find("stock <= 0").unwrap();
        let member_check = RESERVE_SCRIPT.find("'SISMEMBER'").unwrap();
        let decrement = RESERVE_SCRIPT.find("'INCRBY'").unwrap();
        let add = RESERVE_SCRIPT.find("'SADD'").unwrap();
        assert!(stock_check < member_check);
        assert!(member_check < decrement);
        assert!(decrement < add);
    }
}
