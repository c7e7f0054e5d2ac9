/// Assert that a condition becomes true within the default timeout
#[macro_export]
macro_rules! assert_eventually {
    ($cond:expr, $($msg:tt)+) => {
        assert!(
            $crate::wait_for($crate::DEFAULT_TIMEOUT, || $cond).await,
            $($msg)+
        );
    };
}

/// Assert that the next event of the given kind arrives within the default
/// timeout, evaluating to its payload
#[macro_export]
macro_rules! expect_event {
    ($subscription:expr, $kind:ty) => {
        match $crate::next_event::<$kind>(&mut $subscription, $crate::DEFAULT_TIMEOUT).await {
            Some(item) => item,
            None => panic!("no {} within {:?}", stringify!($kind), $crate::DEFAULT_TIMEOUT),
        }
    };
}

/// Assert that no event of the given kind arrives within `$within`
#[macro_export]
macro_rules! assert_no_event {
    ($subscription:expr, $kind:ty, $within:expr) => {
        if let Some(item) = $crate::next_event::<$kind>(&mut $subscription, $within).await {
            panic!("unexpected {}: {:?}", stringify!($kind), item);
        }
    };
}
