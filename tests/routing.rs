use rtmp_relay::{
    config::Config,
    endpoint::{replace_tokens, template_matches, Direction, Kind},
};

#[test]
fn a_server_resolves_into_host_and_client_endpoints() {
    let config: Config = serde_json::from_str(
        r#"{
            "servers": [{
                "listen": ["0.0.0.0:1935"],
                "application": "live",
                "push": [
                    {"addresses": ["127.0.0.1:19350"], "streamName": "{streamName}-backup"},
                    {"addresses": ["127.0.0.1:19351"], "video": false}
                ],
                "pull": [
                    {"addresses": ["127.0.0.1:19352"]}
                ]
            }]
        }"#,
    )
    .unwrap();

    let resolved = config.servers[0].resolve().unwrap();
    let endpoints = &resolved.endpoints;
    assert_eq!(endpoints.len(), 5);

    let hosts: Vec<_> = endpoints.iter().filter(|e| e.kind == Kind::Host).collect();
    assert_eq!(hosts.len(), 2);
    assert!(hosts.iter().any(|e| e.direction == Direction::Input));
    assert!(hosts.iter().any(|e| e.direction == Direction::Output));
    for host in &hosts {
        assert_eq!(host.application_name, "live");
        assert!(host.serves_address("10.0.0.1:1935".parse().unwrap()));
        assert!(host.matches(host.direction, "live", "anything"));
        assert!(!host.matches(host.direction, "vod", "anything"));
    }

    let pushes: Vec<_> = endpoints
        .iter()
        .filter(|e| e.kind == Kind::Client && e.direction == Direction::Output)
        .collect();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0].stream_name, "{streamName}-backup");
    assert!(!pushes[1].video_stream);

    let pulls: Vec<_> = endpoints
        .iter()
        .filter(|e| e.kind == Kind::Client && e.direction == Direction::Input)
        .collect();
    assert_eq!(pulls.len(), 1);
    assert!(!pulls[0].is_name_known());
}

#[test]
fn templates_match_as_wildcards_and_expand_as_literals() {
    assert!(template_matches("", "cam1"));
    assert!(template_matches("{streamName}", "cam1"));
    assert!(template_matches("cam-{id}", "cam-17"));
    assert!(!template_matches("cam-{id}", "mic-17"));

    let tokens = [
        ("streamName", "cam1".to_owned()),
        ("applicationName", "live".to_owned()),
        ("id", "17".to_owned()),
    ];
    assert_eq!(
        replace_tokens("{applicationName}/{streamName}", &tokens),
        "live/cam1"
    );
    assert_eq!(
        replace_tokens("{streamName}.{streamName}", &tokens),
        "cam1.cam1"
    );
}

#[test]
fn missing_listen_defaults_to_the_protocol_port() {
    let config: Config = serde_json::from_str(r#"{"servers": [{"application": "a"}]}"#).unwrap();
    let resolved = config.servers[0].resolve().unwrap();
    assert_eq!(resolved.listen[0].port(), 1935);
}
