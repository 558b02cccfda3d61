// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

fn main() {
    let exit_code = match apple_deepsign::cli::main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);

            if err.is_usage_error() {
                2
            } else {
                1
            }
        }
    };

    std::process::exit(exit_code)
}
