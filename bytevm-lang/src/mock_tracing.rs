#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
