diesel::table! {
    bots (id) {
        id -> Uuid,
        name -> Text,
        ai_provider -> Varchar,
        ai_model -> Varchar,
        system_prompt -> Nullable<Text>,
        temperature -> Nullable<Float8>,
        message_delay_ms -> Int4,
        ignored_labels -> Array<Text>,
        ignore_groups -> Bool,
        ai_enabled -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    sessions (id) {
        id -> Uuid,
        bot_id -> Uuid,
        identifier -> Varchar,
        name -> Nullable<Text>,
        platform -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> Uuid,
        session_id -> Uuid,
        external_id -> Nullable<Varchar>,
        sender -> Varchar,
        from_me -> Bool,
        content -> Text,
        message_type -> Varchar,
        media_url -> Nullable<Text>,
        is_processed -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    tools (id) {
        id -> Uuid,
        bot_id -> Uuid,
        name -> Varchar,
        description -> Text,
        parameters -> Jsonb,
        action_type -> Varchar,
        action_config -> Jsonb,
        status -> Varchar,
        flow_id -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    flows (id) {
        id -> Uuid,
        bot_id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        cooldown_ms -> Int4,
        usage_limit -> Int4,
        excludes_flows -> Array<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    steps (id) {
        id -> Uuid,
        flow_id -> Uuid,
        step_type -> Varchar,
        content -> Nullable<Text>,
        media_url -> Nullable<Text>,
        metadata -> Nullable<Jsonb>,
        delay_ms -> Int4,
        jitter_pct -> Int4,
        step_order -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    triggers (id) {
        id -> Uuid,
        bot_id -> Uuid,
        flow_id -> Uuid,
        keyword -> Text,
        match_type -> Varchar,
        scope -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    labels (id) {
        id -> Uuid,
        bot_id -> Uuid,
        wa_label_id -> Varchar,
        name -> Text,
        color -> Nullable<Int4>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    session_labels (id) {
        id -> Uuid,
        session_id -> Uuid,
        label_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    automations (id) {
        id -> Uuid,
        bot_id -> Uuid,
        name -> Text,
        enabled -> Bool,
        event -> Varchar,
        label_name -> Nullable<Text>,
        timeout_ms -> Int8,
        prompt -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    conversation_logs (id) {
        id -> Uuid,
        session_id -> Uuid,
        role -> Varchar,
        content -> Nullable<Text>,
        tool_name -> Nullable<Varchar>,
        tool_args -> Nullable<Jsonb>,
        tool_call_ref -> Nullable<Varchar>,
        model -> Nullable<Varchar>,
        tokens_used -> Nullable<Int4>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    executions (id) {
        id -> Uuid,
        session_id -> Uuid,
        flow_id -> Uuid,
        status -> Varchar,
        current_step -> Int4,
        error -> Nullable<Text>,
        trigger_keyword -> Nullable<Text>,
        started_at -> Timestamptz,
        updated_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    clients (id) {
        id -> Uuid,
        bot_id -> Uuid,
        phone -> Varchar,
        full_name -> Text,
        curp -> Nullable<Varchar>,
        email -> Nullable<Varchar>,
        credentials -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(sessions -> bots (bot_id));
diesel::joinable!(messages -> sessions (session_id));
diesel::joinable!(tools -> bots (bot_id));
diesel::joinable!(steps -> flows (flow_id));
diesel::joinable!(triggers -> bots (bot_id));
diesel::joinable!(triggers -> flows (flow_id));
diesel::joinable!(labels -> bots (bot_id));
diesel::joinable!(session_labels -> sessions (session_id));
diesel::joinable!(session_labels -> labels (label_id));
diesel::joinable!(automations -> bots (bot_id));
diesel::joinable!(conversation_logs -> sessions (session_id));
diesel::joinable!(executions -> sessions (session_id));
diesel::joinable!(executions -> flows (flow_id));
diesel::joinable!(clients -> bots (bot_id));

diesel::allow_tables_to_appear_in_same_query!(
    bots,
    sessions,
    messages,
    tools,
    flows,
    steps,
    triggers,
    labels,
    session_labels,
    automations,
    conversation_logs,
    executions,
    clients,
);
