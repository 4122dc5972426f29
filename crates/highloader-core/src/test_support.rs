//! Fixtures shared by unit tests.

use std::path::{Path, PathBuf};

pub const ECHO_PROTO: &str = r#"syntax = "proto3";

package demo.echo;

enum Mood {
  MOOD_UNSPECIFIED = 0;
  HAPPY = 1;
  GRUMPY = 2;
}

message SayRequest {
  string text = 1;
  Mood mood = 2;
  map<string, string> tags = 3;
  repeated int32 lucky_numbers = 4;
  Node root = 5;
}

message Node {
  message Leaf {
    enum Color {
      RED = 0;
      BLUE = 1;
    }
    Color color = 1;
    double weight = 2;
  }
  string label = 1;
  repeated Node children = 2;
  Leaf leaf = 3;
}

message SayResponse {
  string text = 1;
}

service Echo {
  rpc Say(SayRequest) returns (SayResponse);
  rpc Listen(SayRequest) returns (stream SayResponse);
  rpc Upload(stream SayRequest) returns (SayResponse);
  rpc Chat(stream SayRequest) returns (stream SayResponse);
}
"#;

pub fn write_proto(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write proto fixture");
    path
}
