// Minimum bid increment for a given current price, tiered by whole-dollar
// bands. All amounts are cents; every band boundary is a whole dollar.
pub(crate) const fn increment_for(price_cents: i64) -> i64 {
    if price_cents < 2_500 {
        100
    } else if price_cents < 5_000 {
        200
    } else if price_cents < 25_000 {
        500
    } else if price_cents < 100_000 {
        1_000
    } else {
        2_500
    }
}

// Smallest amount a challenger must reach to displace the current price.
// Saturates at the top of the range; a price up there cannot be displaced.
pub(crate) const fn min_to_beat(price_cents: i64) -> i64 {
    price_cents.saturating_add(increment_for(price_cents))
}

pub(crate) const fn is_whole_dollar(cents: i64) -> bool {
    cents % 100 == 0
}
