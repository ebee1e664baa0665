// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

fn main() {
    let mut scheme: Option<String> = None;

    for (name, _) in std::env::vars() {
        let prefix = "CARGO_FEATURE_SIGN_";
        if let Some(suffix) = name.strip_prefix(prefix) {
            let suffix = suffix.to_string();
            if let Some(previous) = &scheme {
                panic!(
                    "multiple signature scheme features defined (at least {} and {})",
                    show_feature(previous),
                    show_feature(&suffix)
                );
            }

            scheme = Some(suffix);
        }
    }

    if scheme.is_none() {
        panic!("missing sign-* feature (one of sign-ecc256, sign-ed25519)");
    }
}

fn show_feature(envvar: &str) -> String {
    let mut name = "sign-".to_string();
    name.push_str(&envvar.to_ascii_lowercase().replace('_', "-"));
    name
}
