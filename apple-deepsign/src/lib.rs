// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Deep re-signing of Apple bundles.

This crate discovers every signable component nested inside a bundle
(frameworks, plug-ins, XPC services, helper applications, loose
executables), orders them so inner components are signed before the
bundles sealing them, decides per component whether it needs a new
signature, and drives an external signing primitive to apply it.

The main entry point is [deep_signer::DeepSigner]. Signing and signature
inspection are abstracted behind [executor::SigningPrimitive] and
[classifier::SignatureInspector]; [codesign::CodesignTool] implements both
on top of the `codesign` tool.
*/

pub mod classifier;
pub mod cli;
pub mod code_item;
pub mod codesign;
pub mod deep_signer;
pub mod entitlements;
pub mod error;
pub mod executor;
pub mod order;
pub mod policy;
pub mod report;
pub mod signing_settings;
#[cfg(test)]
mod testutil;
pub mod walker;
