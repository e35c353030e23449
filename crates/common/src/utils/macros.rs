//! Declarative macros for config-facing enums
//!
//! Strategy names, jitter modes and backend kinds arrive as strings from
//! environment variables and config files. These macros keep the string
//! mapping next to the enum definition.

/// Implements `Display` and `FromStr` for a fieldless enum from a label table
///
/// Parsing is case-insensitive; output always uses the label as written.
///
/// # Example
///
/// ```rust,ignore
/// use stack_common::impl_label_conversions;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// pub enum Backend {
///     Memory,
///     Redis,
/// }
///
/// impl_label_conversions!(Backend {
///     Memory => "memory",
///     Redis => "redis",
/// });
///
/// assert_eq!(Backend::Redis.to_string(), "redis");
/// assert_eq!("MEMORY".parse::<Backend>(), Ok(Backend::Memory));
/// ```
#[macro_export]
macro_rules! impl_label_conversions {
    ($enum_name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $enum_name {
            /// Stable label used in configuration and logs.
            pub const fn label(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase();
                $(
                    if lowered == $label.to_ascii_lowercase() {
                        return Ok(Self::$variant);
                    }
                )+
                Err(format!("Invalid {}: {}", stringify!($enum_name), s))
            }
        }
    };
}
