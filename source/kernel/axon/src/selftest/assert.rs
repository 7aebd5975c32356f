// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Serial-friendly selftest assertion helpers.

extern crate alloc;

use alloc::format;

use crate::uart;

/// Emits the failure message and panics so the panic handler can dump the
/// machine state afterwards.
#[cold]
#[allow(dead_code)]
pub fn report_failure(message: &str) -> ! {
    let line = format!("SELFTEST: fail: {message}");
    uart::write_line(&line);
    panic!("{}", line);
}

#[cold]
#[allow(dead_code)]
pub fn report_failure_fmt(args: core::fmt::Arguments<'_>) -> ! {
    use core::fmt::Write;

    let mut buffer = alloc::string::String::new();
    let _ = write!(buffer, "{args}");
    report_failure(&buffer);
}

/// Asserts that the condition holds.
#[macro_export]
macro_rules! st_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::selftest::assert::report_failure(concat!(
                "assertion failed: ",
                stringify!($cond)
            ));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::selftest::assert::report_failure_fmt(format_args!($($arg)+));
        }
    };
}

/// Expects both expressions to compare equal.
#[macro_export]
macro_rules! st_expect_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let left = &$left;
        let right = &$right;
        if *left != *right {
            $crate::selftest::assert::report_failure_fmt(format_args!(
                "expected {} == {}: left={:?} right={:?}",
                stringify!($left),
                stringify!($right),
                left,
                right
            ));
        }
    }};
}

/// Expects the expression to evaluate to `Err` matching the pattern.
#[macro_export]
macro_rules! st_expect_err {
    ($expr:expr, $pat:pat $(,)?) => {{
        match $expr {
            Err(err) => {
                if !matches!(err, $pat) {
                    $crate::selftest::assert::report_failure_fmt(format_args!(
                        "unexpected error variant: got={:?}",
                        err
                    ));
                }
            }
            Ok(_) => {
                $crate::selftest::assert::report_failure(concat!(
                    "expected Err(",
                    stringify!($pat),
                    "), got Ok"
                ));
            }
        }
    }};
}
