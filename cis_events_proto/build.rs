// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .bytes(&[".cis.events.v1.Event.payload"])
        .compile_protos(&["proto/events.proto"], &["proto"])?;
    Ok(())
}
