// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling. */

use {
    crate::error::InspectionError,
    bitflags::bitflags,
    plist::Value,
    serde::{Serialize, Serializer},
};

bitflags! {
    /// Entitlements that relax runtime protections or allow debugging.
    ///
    /// These are the keys users most often rely on when re-signing third
    /// party code, so their presence is surfaced explicitly.
    pub struct RuntimeExceptions: u32 {
        const GET_TASK_ALLOW = 0x0001;
        const DEBUGGER = 0x0002;
        const ALLOW_JIT = 0x0004;
        const ALLOW_UNSIGNED_EXECUTABLE_MEMORY = 0x0008;
        const ALLOW_DYLD_ENVIRONMENT_VARIABLES = 0x0010;
        const DISABLE_LIBRARY_VALIDATION = 0x0020;
        const DISABLE_EXECUTABLE_PAGE_PROTECTION = 0x0040;
    }
}

const RUNTIME_EXCEPTION_KEYS: &[(&str, RuntimeExceptions)] = &[
    ("get-task-allow", RuntimeExceptions::GET_TASK_ALLOW),
    (
        "com.apple.security.get-task-allow",
        RuntimeExceptions::GET_TASK_ALLOW,
    ),
    ("com.apple.security.cs.debugger", RuntimeExceptions::DEBUGGER),
    (
        "com.apple.private.cs.debugger",
        RuntimeExceptions::DEBUGGER,
    ),
    ("com.apple.security.cs.allow-jit", RuntimeExceptions::ALLOW_JIT),
    ("dynamic-codesigning", RuntimeExceptions::ALLOW_JIT),
    (
        "com.apple.security.cs.allow-unsigned-executable-memory",
        RuntimeExceptions::ALLOW_UNSIGNED_EXECUTABLE_MEMORY,
    ),
    (
        "com.apple.security.cs.allow-dyld-environment-variables",
        RuntimeExceptions::ALLOW_DYLD_ENVIRONMENT_VARIABLES,
    ),
    (
        "com.apple.security.cs.disable-library-validation",
        RuntimeExceptions::DISABLE_LIBRARY_VALIDATION,
    ),
    (
        "com.apple.security.cs.disable-executable-page-protection",
        RuntimeExceptions::DISABLE_EXECUTABLE_PAGE_PROTECTION,
    ),
];

/// Entitlements attached to an existing code signature.
///
/// The raw blob is retained verbatim so it can be carried forward into a new
/// signature byte for byte.
#[derive(Clone, Debug, PartialEq)]
pub struct Entitlements {
    blob: Vec<u8>,
    dictionary: plist::Dictionary,
}

impl Entitlements {
    /// Parse an XML (or binary) plist entitlements blob.
    pub fn from_blob(blob: impl Into<Vec<u8>>) -> Result<Self, InspectionError> {
        let blob = blob.into();

        let value = Value::from_reader(std::io::Cursor::new(&blob))
            .map_err(|e| InspectionError::MalformedEntitlements(e.to_string()))?;

        let dictionary = value.into_dictionary().ok_or_else(|| {
            InspectionError::MalformedEntitlements("entitlements are not a dictionary".into())
        })?;

        Ok(Self { blob, dictionary })
    }

    /// The raw entitlements blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// The parsed entitlements dictionary.
    pub fn dictionary(&self) -> &plist::Dictionary {
        &self.dictionary
    }

    pub fn is_empty(&self) -> bool {
        self.dictionary.is_empty()
    }

    /// Entitlement keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys = self.dictionary.keys().map(|k| k.as_str()).collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }

    /// Resolve runtime exceptions granted by these entitlements.
    pub fn runtime_exceptions(&self) -> RuntimeExceptions {
        let mut flags = RuntimeExceptions::empty();

        for (key, flag) in RUNTIME_EXCEPTION_KEYS {
            if matches!(self.dictionary.get(key), Some(Value::Boolean(true))) {
                flags |= *flag;
            }
        }

        flags
    }
}

impl Serialize for Entitlements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.keys())
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    const DEBUG_ENTITLEMENTS: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>com.apple.security.get-task-allow</key>
            <true/>
            <key>com.apple.security.cs.allow-jit</key>
            <false/>
            <key>com.example.debug</key>
            <true/>
        </dict>
        </plist>
    "#};

    #[test]
    fn parse_entitlements() {
        let e = Entitlements::from_blob(DEBUG_ENTITLEMENTS.as_bytes()).unwrap();

        assert_eq!(e.blob(), DEBUG_ENTITLEMENTS.as_bytes());
        assert!(!e.is_empty());
        assert_eq!(
            e.keys(),
            vec![
                "com.apple.security.cs.allow-jit",
                "com.apple.security.get-task-allow",
                "com.example.debug"
            ]
        );
        assert_eq!(e.runtime_exceptions(), RuntimeExceptions::GET_TASK_ALLOW);
    }

    #[test]
    fn reject_non_dictionary() {
        let array = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <plist version="1.0">
            <array><string>foo</string></array>
            </plist>
        "#};

        assert!(matches!(
            Entitlements::from_blob(array.as_bytes()),
            Err(InspectionError::MalformedEntitlements(_))
        ));
        assert!(Entitlements::from_blob(b"garbage".to_vec()).is_err());
    }
}
